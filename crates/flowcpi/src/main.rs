mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "flowcpi")]
#[command(about = "Cloud Provider Interface: one JSON command on stdin, one JSON response on stdout", long_about = None)]
struct Cli {
    /// Configuration file (cpi.yml / cpi.json); falls back to FLOWCPI_CONFIG
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Handle one command per input line until EOF
    #[arg(long)]
    persistent: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a light stemcell tarball
    Package {
        /// Stemcell name
        #[arg(long)]
        name: String,
        /// Stemcell version
        #[arg(long)]
        version: String,
        /// Operating system (e.g. ubuntu-jammy)
        #[arg(long)]
        os: String,
        /// Backend image the stemcell points at
        #[arg(long)]
        image_id: String,
        /// Directory to write the tarball into
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries responses, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match cli.command {
        None => commands::serve::handle(cli.config.as_deref(), cli.persistent).await,
        Some(Commands::Package {
            name,
            version,
            os,
            image_id,
            output_dir,
        }) => commands::package::handle(&name, &version, &os, &image_id, &output_dir),
        Some(Commands::Version) => {
            println!("flowcpi {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
