use crate::config::DEFAULT_CONFIG_PATH;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tlfs")]
#[command(about = "Mount a robotic tape library as a filesystem")]
#[command(version)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Create an empty catalog and exit
    #[arg(long)]
    pub init: bool,

    /// Replace an existing catalog (with --init)
    #[arg(long, requires = "init")]
    pub force: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
