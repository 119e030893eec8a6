//! Multi-threaded stress test of a checkpoint
//!
//! Workers repeatedly take passes to a small set of resource ids and record
//! how many of them are inside each section at once. Any overlap the
//! checkpoint should have prevented counts as a violation.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use checkpoint_core::{
    AnyCheckpoint, Checkpoint, CheckpointBuilder, CheckpointConfig, CheckpointError, Interrupter,
    RegistryKind,
};
use tracing::{debug, info, warn};

/// Stress test settings
#[derive(Debug)]
pub struct StressCommand {
    pub threads: usize,
    pub applicants: usize,
    pub capacity: Option<u32>,
    pub duration_ms: u64,
    pub reentrant_depth: u32,
    pub hold_ms: u64,
    pub fair: bool,
    pub global_limit: Option<u32>,
    pub config: Option<PathBuf>,
}

/// Live counters of one resource id
#[derive(Debug, Default)]
struct ResourceStats {
    readers: AtomicU64,
    writers: AtomicU64,
    waiting: AtomicU64,
    max_in: AtomicU64,
    grants: AtomicU64,
    violations: AtomicU64,
}

impl ResourceStats {
    fn enter(&self, exclusive: bool, capacity: u64) {
        let (readers, writers) = if exclusive {
            let writers = self.writers.fetch_add(1, Ordering::SeqCst) + 1;
            (self.readers.load(Ordering::SeqCst), writers)
        } else {
            let readers = self.readers.fetch_add(1, Ordering::SeqCst) + 1;
            (readers, self.writers.load(Ordering::SeqCst))
        };

        self.grants.fetch_add(1, Ordering::Relaxed);
        self.max_in.fetch_max(readers + writers, Ordering::SeqCst);
        if writers > 1 || (writers > 0 && readers > 0) || readers > capacity {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn leave(&self, exclusive: bool) {
        if exclusive {
            self.writers.fetch_sub(1, Ordering::SeqCst);
        } else {
            self.readers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn in_section(&self) -> u64 {
        self.readers.load(Ordering::SeqCst) + self.writers.load(Ordering::SeqCst)
    }
}

struct Worker {
    checkpoint: AnyCheckpoint<u64>,
    stats: Arc<ResourceStats>,
    resource: u64,
    exclusive: bool,
    capacity: u64,
    hold: Duration,
}

impl Worker {
    /// Take a pass, nest `depth` more levels, and return whether to keep going
    fn visit(&self, depth: u32, outermost: bool) -> bool {
        let stats = &self.stats;
        stats.waiting.fetch_add(1, Ordering::SeqCst);
        let pass = if self.exclusive {
            self.checkpoint.exclusive(&self.resource)
        } else {
            self.checkpoint.shared(&self.resource)
        };
        stats.waiting.fetch_sub(1, Ordering::SeqCst);

        let pass = match pass {
            Ok(pass) => pass,
            Err(CheckpointError::Interrupted) => return false,
            Err(err) => {
                warn!(resource = self.resource, error = %err, "acquisition failed");
                return false;
            }
        };

        if outermost {
            stats.enter(self.exclusive, self.capacity);
        }
        thread::sleep(self.hold);
        let keep_going = depth == 0 || self.visit(depth - 1, false);
        if outermost {
            stats.leave(self.exclusive);
        }
        drop(pass);
        keep_going
    }
}

impl StressCommand {
    fn checkpoint_config(&self) -> Result<CheckpointConfig> {
        let mut config = match &self.config {
            Some(path) => CheckpointConfig::from_toml_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => CheckpointConfig {
                name: "stress".to_string(),
                capacity: 3,
                ..CheckpointConfig::default()
            },
        };

        if let Some(capacity) = self.capacity {
            config.capacity = capacity;
        }
        if self.fair {
            config.fair = true;
        }
        if self.global_limit.is_some() {
            config.global_limit = self.global_limit;
        }
        if self.reentrant_depth > 0 {
            config.reentrant = true;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn execute(self) -> Result<()> {
        if self.threads == 0 || self.applicants == 0 {
            bail!("threads and applicants must both be positive");
        }

        let config = self.checkpoint_config()?;
        let capacity = u64::from(config.capacity);
        let depth = if config.reentrant { self.reentrant_depth } else { 0 };
        let checkpoint: AnyCheckpoint<u64> = CheckpointBuilder::from_config(config.clone()).build()?;
        info!(
            checkpoint = %checkpoint.name(),
            threads = self.threads,
            applicants = self.applicants,
            capacity,
            reentrant = config.reentrant,
            depth,
            global_limit = ?config.global_limit,
            "starting stress run"
        );

        let stats: Vec<Arc<ResourceStats>> = (0..self.applicants)
            .map(|_| Arc::new(ResourceStats::default()))
            .collect();
        let stop = Arc::new(AtomicBool::new(false));
        let (interrupters_tx, interrupters_rx) = mpsc::channel();

        let handles: Vec<_> = (0..self.threads)
            .map(|index| {
                let resource = index % self.applicants;
                let worker = Worker {
                    checkpoint: checkpoint.clone(),
                    stats: stats[resource].clone(),
                    resource: resource as u64,
                    exclusive: (index / self.applicants) % 2 == 1,
                    capacity,
                    hold: Duration::from_millis(self.hold_ms),
                };
                let stop = stop.clone();
                let interrupters_tx = interrupters_tx.clone();
                thread::Builder::new()
                    .name(format!("worker-{}", index))
                    .spawn(move || {
                        let _ = interrupters_tx.send(Interrupter::current());
                        while !stop.load(Ordering::SeqCst) {
                            if !worker.visit(depth, true) {
                                break;
                            }
                        }
                    })
                    .context("failed to spawn worker")
            })
            .collect::<Result<Vec<_>>>()?;
        drop(interrupters_tx);
        let interrupters: Vec<Interrupter> = interrupters_rx.iter().take(self.threads).collect();

        let started = Instant::now();
        thread::sleep(Duration::from_millis(self.duration_ms));
        stop.store(true, Ordering::SeqCst);
        for interrupter in &interrupters {
            interrupter.interrupt();
        }
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "stopping workers");

        for handle in handles {
            if handle.join().is_err() {
                bail!("a worker thread panicked");
            }
        }

        print_table(&stats);

        let violations: u64 = stats
            .iter()
            .map(|row| row.violations.load(Ordering::SeqCst))
            .sum();
        if violations > 0 {
            bail!("{} access invariant violations detected", violations);
        }
        if let (Some(limit), Some(available)) =
            (checkpoint.global_limit(), checkpoint.available_global_permits())
        {
            if available != limit {
                bail!("global permits leaked: {} of {} available", available, limit);
            }
        }
        if config.registry == RegistryKind::RefCounted && !checkpoint.registry().is_empty() {
            bail!(
                "{} gates left in the registry after all passes were released",
                checkpoint.registry().len()
            );
        }

        info!("stress run passed");
        Ok(())
    }
}

fn print_table(stats: &[Arc<ResourceStats>]) {
    println!(
        "{:>12} {:>18} {:>15} {:>14} {:>10} {:>10}",
        "Applicant ID", "Threads In Section", "Threads Waiting", "Max Threads In", "Grants", "Violations"
    );
    for (id, row) in stats.iter().enumerate() {
        println!(
            "{:>12} {:>18} {:>15} {:>14} {:>10} {:>10}",
            id,
            row.in_section(),
            row.waiting.load(Ordering::SeqCst),
            row.max_in.load(Ordering::SeqCst),
            row.grants.load(Ordering::Relaxed),
            row.violations.load(Ordering::SeqCst),
        );
    }
}
