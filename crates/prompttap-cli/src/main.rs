use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use prompttap::config::Config;
use prompttap_cli::commands::{CountCommand, ListCommand, StatsCommand, open_sink};
use prompttap_cli::error::CliResult;
use prompttap_cli::output::OutputFormat;

#[derive(Parser)]
#[command(name = "prompttap-cli")]
#[command(about = "prompttap CLI - browse recorded prompts")]
#[command(version)]
pub struct Cli {
    #[clap(long, short, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[clap(long, short = 'c', global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    #[clap(long, global = true, help = "Read only the fallback JSONL files")]
    pub fallback_only: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[clap(about = "List recorded prompts, newest first")]
    List(ListCommand),

    #[clap(about = "Count recorded prompts")]
    Count(CountCommand),

    #[clap(about = "Show usage statistics")]
    Stats(StatsCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();
    init_logging();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    let config = Config::load(cli.config.as_deref())?;
    let sink = open_sink(&config, cli.fallback_only).await?;

    match &cli.command {
        Command::List(cmd) => cmd.execute(sink.as_ref(), format).await,
        Command::Count(cmd) => cmd.execute(sink.as_ref(), format).await,
        Command::Stats(cmd) => cmd.execute(sink.as_ref(), format).await,
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
