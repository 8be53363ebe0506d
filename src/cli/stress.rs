use anyhow::{Context, Result};
use comfy_table::{Cell, Table, presets::UTF8_FULL};
use num_format::{Locale, ToFormattedString};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};
use vcache::config::Settings;
use vcache::driver::Mount;
use vcache::errors::VnodeError;
use vcache::memfs::MemFs;
use vcache::stats::StatsSnapshot;
use vcache::vnode::VType;
use vcache::VnodeCache;

pub struct StressOptions {
    pub mounts: usize,
    pub keys: u64,
    pub tasks: usize,
    pub ops: usize,
    pub drain_to: Option<usize>,
}

#[derive(Debug, Default)]
struct Outcomes {
    ops: AtomicU64,
    busy: AtomicU64,
    not_found: AtomicU64,
    failed: AtomicU64,
}

impl Outcomes {
    fn record(&self, result: Result<(), VnodeError>) {
        self.ops.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(()) => {}
            Err(VnodeError::Busy) => {
                self.busy.fetch_add(1, Ordering::Relaxed);
            }
            Err(VnodeError::NotFound) => {
                self.not_found.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("Operation failed: {}", e);
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct Report {
    elapsed_ms: u128,
    ops: u64,
    busy: u64,
    not_found: u64,
    failed: u64,
    drained_to: Option<usize>,
    stats: StatsSnapshot,
}

fn init_logging() {
    #[cfg(feature = "tokio-console")]
    console_subscriber::init();

    #[cfg(not(feature = "tokio-console"))]
    {
        use tracing_subscriber::EnvFilter;

        let filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn one_op(
    cache: &Arc<VnodeCache<MemFs>>,
    mount: &Arc<Mount<MemFs>>,
    key: [u8; 8],
    roll: u32,
) -> Result<(), VnodeError> {
    match roll {
        0..60 => cache.get(mount, &key).await?.release().await,
        60..80 => drop(cache.get(mount, &key).await?),
        80..90 => {
            let handle = cache.get(mount, &key).await?;
            handle.write().await?.dirty = true;
            cache.hold(&handle);
            cache.hold_release(&handle);
            handle.release().await;
        }
        90..95 => {
            let handle = cache.get(mount, &key).await?;
            cache.gone(handle).await;
        }
        _ => cache.get_nowait(mount, &key).await?.release_nonblocking(),
    }
    Ok(())
}

pub async fn run_stress(config: Option<PathBuf>, options: StressOptions, json: bool) -> Result<()> {
    init_logging();

    let settings = match &config {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Settings::default(),
    };

    info!(
        "Starting stress run: {} mounts x {} keys, {} tasks x {} ops",
        options.mounts, options.keys, options.tasks, options.ops
    );

    let cache = VnodeCache::<MemFs>::new(&settings);
    cache.start();

    let mounts: Vec<_> = (0..options.mounts.max(1))
        .map(|_| {
            let mount = Mount::new(MemFs::new());
            let inos: Vec<u64> = (0..options.keys.max(1))
                .map(|_| mount.driver().mknod(VType::Reg, None))
                .collect();
            (mount, inos)
        })
        .collect();
    let mounts = Arc::new(mounts);
    let outcomes = Arc::new(Outcomes::default());

    let started = Instant::now();
    let workers: Vec<_> = (0..options.tasks.max(1))
        .map(|_| {
            let cache = Arc::clone(&cache);
            let mounts = Arc::clone(&mounts);
            let outcomes = Arc::clone(&outcomes);
            let ops = options.ops;
            tokio::spawn(async move {
                let mut rng = StdRng::from_entropy();
                for _ in 0..ops {
                    let (mount, inos) = &mounts[rng.gen_range(0..mounts.len())];
                    let ino = inos[rng.gen_range(0..inos.len())];
                    let roll = rng.gen_range(0..100);
                    outcomes.record(one_op(&cache, mount, MemFs::key(ino), roll).await);
                }
            })
        })
        .collect();

    for result in futures::future::join_all(workers).await {
        result.context("Stress task panicked")?;
    }
    cache
        .flush_releases()
        .await
        .context("Release worker stopped during the run")?;

    if let Some(target) = options.drain_to {
        match cache.drain_to(target).await {
            Ok(()) => info!("Drained to {} vnodes", target),
            Err(e) => warn!("Could not drain to {} vnodes: {}", target, e),
        }
    }

    let report = Report {
        elapsed_ms: started.elapsed().as_millis(),
        ops: outcomes.ops.load(Ordering::Relaxed),
        busy: outcomes.busy.load(Ordering::Relaxed),
        not_found: outcomes.not_found.load(Ordering::Relaxed),
        failed: outcomes.failed.load(Ordering::Relaxed),
        drained_to: options.drain_to,
        stats: cache.stats(),
    };
    cache.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_table(&report);
    }

    if report.failed > 0 {
        anyhow::bail!("{} operations failed", report.failed);
    }
    Ok(())
}

fn print_table(report: &Report) {
    let stats = &report.stats;
    let rows: [(&str, u64); 22] = [
        ("Operations", report.ops),
        ("Busy", report.busy),
        ("Not found", report.not_found),
        ("Failed", report.failed),
        ("Live vnodes", stats.numvnodes),
        ("Desired vnodes", stats.desired_vnodes),
        ("Free (no hold)", stats.free_no_hold),
        ("Free (hold)", stats.free_hold),
        ("Cached keys", stats.cached),
        ("Allocated", stats.allocated),
        ("Destroyed", stats.destroyed),
        ("Loads", stats.loads),
        ("Load failures", stats.load_failures),
        ("Creates", stats.creates),
        ("Create failures", stats.create_failures),
        ("Cache hits", stats.cache_hits),
        ("Reused from free list", stats.reused),
        ("Parked", stats.parked),
        ("Deferred releases", stats.deferred_releases),
        ("Reclaims", stats.reclaims),
        ("Drained", stats.drained),
        ("Elapsed (ms)", report.elapsed_ms as u64),
    ];

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Metric", "Value"]);
    for (name, value) in rows {
        table.add_row(vec![
            Cell::new(name),
            Cell::new(value.to_formatted_string(&Locale::en)),
        ]);
    }

    println!("{table}");
}
