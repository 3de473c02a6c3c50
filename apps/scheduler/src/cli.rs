use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "compute-gardener-scheduler",
    about = "Carbon- and price-aware scheduler extender"
)]
pub struct Args {
    /// Path to the YAML configuration file. Environment variables override
    /// file values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Listen address for the extender HTTP endpoints.
    #[arg(long)]
    pub listen_addr: Option<String>,
}
