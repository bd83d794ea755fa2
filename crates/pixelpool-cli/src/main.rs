//! Pixelpool CLI - Convert images locally across a pool of isolated workers.

mod colors;
mod convert;
mod report;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pixelpool")]
#[command(about = "Convert images to WebP, PNG or JPEG in parallel")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert image files
    Convert(convert::ConvertArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Convert(args) => convert::execute(args).await?,
    }

    Ok(())
}
