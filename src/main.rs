use anyhow::Result;

mod cli;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse_args();

    match cli.command {
        cli::Commands::Init { path } => {
            println!("Generating configuration file at: {}", path.display());
            vcache::config::Settings::write_default_config(&path)?;
            println!("Configuration file created successfully!");
            println!("Edit the file and run: vcache stress -c {}", path.display());
        }
        cli::Commands::Stress {
            config,
            mounts,
            keys,
            tasks,
            ops,
            json,
            drain_to,
        } => {
            let options = cli::stress::StressOptions {
                mounts,
                keys,
                tasks,
                ops,
                drain_to,
            };
            cli::stress::run_stress(config, options, json).await?;
        }
    }

    Ok(())
}
