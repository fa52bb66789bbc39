use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

use crate::cli::config::try_load_config;
use crate::cli::{FillArgs, FillMode};
use crate::fill::{
    fill_day, fill_flex, fill_week, fill_year, parse_anchor, SparseSeries, TimeSlotSeries,
    DEFAULT_DAY_INTERVAL_MINUTES,
};

pub fn execute_fill(args: FillArgs) -> Result<()> {
    let sparse = read_sparse(args.input.as_deref())?;
    let series = fill(args.mode, &sparse)?;

    tracing::debug!(slots = series.len(), filled = series.filled(), "series filled");
    println!("{}", serde_json::to_string_pretty(&series)?);
    Ok(())
}

fn fill(mode: FillMode, sparse: &SparseSeries) -> Result<TimeSlotSeries> {
    let series = match mode {
        FillMode::Day { date, interval } => {
            let interval = interval
                .or_else(|| try_load_config().map(|config| config.day_interval_minutes))
                .unwrap_or(DEFAULT_DAY_INTERVAL_MINUTES);
            fill_day(date, sparse, interval)?
        }
        FillMode::Week { date } => fill_week(date, sparse)?,
        FillMode::Year { year } => fill_year(year, sparse)?,
        FillMode::Flex { from, until, step } => {
            let from = parse_anchor(&from).context("Invalid FROM")?;
            let until = parse_anchor(&until).context("Invalid UNTIL")?;
            fill_flex(from, until, sparse, step)?
        }
    };
    Ok(series)
}

fn read_sparse(path: Option<&Path>) -> Result<SparseSeries> {
    let content = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };
    serde_json::from_str(&content).context("Input must be a JSON object of timestamp -> number|null")
}
