use clap::Parser;
use sensorchart::cli::{commands, Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    sensorchart::native::init_tracing(cli.log_json);

    match cli.command {
        Commands::Fill(args) => commands::execute_fill(args)?,
        Commands::Day(args) => commands::execute_day(args).await?,
    }

    Ok(())
}
