pub mod commands;
pub mod config;

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use crate::fill::Step;

#[derive(Parser)]
#[command(name = "sensorchart")]
#[command(about = "Gap-free time series and live sums from a sensor service")]
#[command(version)]
pub struct Cli {
    /// Log as JSON lines instead of human-readable text
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fill the gaps of a sparse series on a regular time grid
    Fill(FillArgs),
    /// Print the per-label sums of one day, following live updates for today
    Day(DayArgs),
}

#[derive(clap::Args)]
pub struct FillArgs {
    /// JSON object of "YYYY-MM-DD HH:MM:SS" -> value (stdin if not specified)
    #[arg(long, global = true)]
    pub input: Option<PathBuf>,

    #[command(subcommand)]
    pub mode: FillMode,
}

#[derive(Subcommand)]
pub enum FillMode {
    /// Every slot of one day
    Day {
        date: NaiveDate,

        /// Slot distance in minutes (falls back to .sensorchart.toml, then 5)
        #[arg(long)]
        interval: Option<u32>,
    },
    /// Monday to Sunday of the week containing the date
    Week { date: NaiveDate },
    /// Every ISO week of the year
    Year { year: i32 },
    /// Custom range and step
    Flex {
        /// Start, "YYYY-MM-DD" or "YYYY-MM-DD HH:MM[:SS]"
        from: String,

        /// Inclusive end, same formats as FROM
        until: String,

        /// Step such as "15min", "1h", "2 weeks", "1 month"
        #[arg(long, default_value = "1h")]
        step: Step,
    },
}

#[derive(clap::Args)]
pub struct DayArgs {
    /// Thing id
    #[arg(long)]
    pub thing: u64,

    /// Datastream filter expression
    #[arg(long, default_value = "")]
    pub filter: String,

    /// Day to sum (today if not specified)
    #[arg(long)]
    pub date: Option<NaiveDate>,

    /// Config file (falls back to .sensorchart.toml in the working or home directory)
    #[arg(long)]
    pub config: Option<PathBuf>,
}
