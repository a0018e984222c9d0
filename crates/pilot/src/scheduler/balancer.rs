//! Balancer
//!
//! Single background loop. A round splits oversized chunks, then moves
//! chunks from the most to the least loaded up shard of every namespace
//! until the spread is within the threshold.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::interval;
use tracing::{debug, info, warn};

use ds_core::{Chunk, ShardId};

use super::migration::{MigrationCoordinator, MigrationError, MigrationTicket};
use super::split::SplitPlanner;
use crate::authority::ConfigAuthority;
use crate::config::BalancerConfig;

/// What a round did
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoundReport {
    /// Another round was already running
    pub skipped: bool,
    pub enabled: bool,
    pub splits: usize,
    pub migrations: Vec<MigrationTicket>,
    pub failures: usize,
}

/// A move from the most to the least loaded shard
#[derive(Debug, Clone)]
struct Move {
    chunk: Chunk,
    to: ShardId,
}

pub struct Balancer {
    config: BalancerConfig,
    authority: Arc<ConfigAuthority>,
    planner: Arc<SplitPlanner>,
    coordinator: Arc<MigrationCoordinator>,
    round: Mutex<()>,
    wake: Notify,
    rounds: AtomicU64,
    migrations_started: AtomicU64,
}

impl Balancer {
    pub fn new(
        config: BalancerConfig,
        authority: Arc<ConfigAuthority>,
        planner: Arc<SplitPlanner>,
        coordinator: Arc<MigrationCoordinator>,
    ) -> Self {
        Self {
            config,
            authority,
            planner,
            coordinator,
            round: Mutex::new(()),
            wake: Notify::new(),
            rounds: AtomicU64::new(0),
            migrations_started: AtomicU64::new(0),
        }
    }

    /// Run one round now. Returns immediately if a round is in progress.
    pub async fn run_round(&self) -> RoundReport {
        let Ok(_round) = self.round.try_lock() else {
            debug!("Balancer round already running");
            return RoundReport {
                skipped: true,
                ..Default::default()
            };
        };
        self.rounds.fetch_add(1, Ordering::SeqCst);

        let mut report = RoundReport::default();
        if !self.authority.balancer_settings().await.enabled {
            debug!("Balancer disabled, nothing to do");
            return report;
        }
        report.enabled = true;

        if self.config.auto_split {
            match self.planner.auto_split_pass().await {
                Ok(splits) => report.splits = splits.len(),
                Err(e) => warn!("Auto-split pass failed: {}", e),
            }
        }

        let namespaces: Vec<String> = self
            .authority
            .snapshot()
            .await
            .chunks
            .namespaces()
            .cloned()
            .collect();

        'namespaces: for ns in namespaces {
            loop {
                if report.migrations.len() >= self.config.max_migrations_per_round {
                    break 'namespaces;
                }
                let Some(planned) = self.plan_move(&ns).await else {
                    continue 'namespaces;
                };
                // balancerStop must take effect before the next migration
                if !self.authority.balancer_settings().await.enabled {
                    info!("Balancer stopped mid-round");
                    break 'namespaces;
                }

                self.migrations_started.fetch_add(1, Ordering::SeqCst);
                match self
                    .coordinator
                    .move_chunk(&ns, &planned.chunk.id, &planned.to)
                    .await
                {
                    Ok(ticket) => report.migrations.push(ticket),
                    Err(MigrationError::Conflict { chunk, .. }) => {
                        debug!("Chunk {} is busy, skipping {}", chunk, ns);
                        continue 'namespaces;
                    }
                    Err(e) => {
                        warn!("Balancer migration in {} failed: {}", ns, e);
                        report.failures += 1;
                        continue 'namespaces;
                    }
                }
            }
        }

        if !report.migrations.is_empty() || report.splits > 0 {
            info!(
                "Balancer round: {} splits, {} migrations, {} failures",
                report.splits,
                report.migrations.len(),
                report.failures
            );
        }
        report
    }

    /// Next move for `ns`, if the namespace is out of balance
    async fn plan_move(&self, ns: &str) -> Option<Move> {
        let state = self.authority.snapshot().await;
        let up = state.up_shards();
        if up.len() < 2 {
            return None;
        }
        let map = state.chunks.chunk_map(ns)?;

        let counts = map.chunk_counts(&up);
        let loads: Vec<(&ShardId, usize)> = counts
            .iter()
            .filter(|(shard, _)| up.contains(shard))
            .map(|(shard, count)| (shard, *count))
            .collect();
        // ties go to the lowest shard id
        let (busiest, max) = loads
            .iter()
            .copied()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))?;
        let (idlest, min) = loads.iter().copied().min_by_key(|(_, count)| *count)?;

        if max - min <= self.config.imbalance_threshold {
            return None;
        }

        let chunk = map
            .chunks_on(busiest)
            .find(|c| !self.coordinator.is_locked(ns, &c.id))?
            .clone();
        debug!(
            "{} imbalance {} ({}) vs {} ({}): moving {}",
            ns, busiest, max, idlest, min, chunk.id
        );
        Some(Move {
            chunk,
            to: idlest.clone(),
        })
    }

    /// Wake the loop for an immediate round
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::SeqCst)
    }

    /// Migrations started since startup
    pub fn migrations_started(&self) -> u64 {
        self.migrations_started.load(Ordering::SeqCst)
    }

    /// Start the balancer loop
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let round_interval = self.config.round_interval();

        tokio::spawn(async move {
            let mut interval = interval(round_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = self.wake.notified() => {}
                }
                self.run_round().await;
            }
        })
    }
}
