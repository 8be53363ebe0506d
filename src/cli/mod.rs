use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod stress;

#[derive(Parser)]
#[command(name = "vcache")]
#[command(author, version, about = "Vnode cache and lifecycle manager", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a default configuration file
    Init {
        #[arg(default_value = "vcache.toml")]
        path: PathBuf,
    },
    /// Run a concurrent workload against in-memory mounts and report cache statistics
    Stress {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Number of in-memory file systems
        #[arg(long, default_value_t = 2)]
        mounts: usize,
        /// Files per file system
        #[arg(long, default_value_t = 1000)]
        keys: u64,
        /// Concurrent client tasks
        #[arg(long, default_value_t = 8)]
        tasks: usize,
        /// Operations per task
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
        /// Drain to this many vnodes once the workload finishes
        #[arg(long)]
        drain_to: Option<usize>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
