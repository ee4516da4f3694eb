use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use undertow::{Client, ClientConfig, ClientError, Metainfo};

#[derive(Parser, Debug)]
#[command(version, about = "A single-file BitTorrent download client")]
struct Args {
    /// Path to the .torrent metainfo file
    #[arg(long)]
    file: PathBuf,

    /// Log at debug level instead of info
    #[arg(long)]
    verbose: bool,
}

async fn run(args: Args) -> undertow::Result<()> {
    let raw = std::fs::read(&args.file).map_err(|e| {
        ClientError::config(format!("could not read {:?}: {}", args.file, e))
    })?;
    let metainfo = Metainfo::parse(&raw)?;

    let client = Client::new(ClientConfig::default());
    let path = client.download(metainfo).await?;
    println!("{}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
