//! In-process config replica set
//!
//! Every replica keeps its own log file. The leader is the live replica
//! with the most up-to-date log (ties broken by priority), elected only
//! while a majority of replicas is up.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::consensus::{
    Consensus, ConsensusError, EntryStatus, Leadership, LogEntry, MemberInfo, ReplicaId,
};
use crate::config::ReplicaConfig;
use crate::metadata::MetadataChange;
use crate::storage::FileStorage;

struct Replica {
    id: ReplicaId,
    priority: u32,
    up: bool,
    log: Vec<LogEntry>,
    storage: FileStorage,
}

impl Replica {
    fn last_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(0)
    }

    fn last_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    fn committed_index(&self) -> u64 {
        self.log
            .iter()
            .rev()
            .find(|e| e.is_committed())
            .map(|e| e.index)
            .unwrap_or(0)
    }

    fn entry(&self, index: u64) -> Option<&LogEntry> {
        self.log.iter().rev().find(|e| e.index == index)
    }

    fn entry_mut(&mut self, index: u64) -> Option<&mut LogEntry> {
        self.log.iter_mut().rev().find(|e| e.index == index)
    }

    fn holds(&self, entry: &LogEntry) -> bool {
        self.entry(entry.index)
            .map(|e| e.term == entry.term)
            .unwrap_or(false)
    }

    async fn persist(&self) -> Result<(), ConsensusError> {
        self.storage.save_log(&self.log).await?;
        Ok(())
    }
}

/// Cheap log-matching check: same length and same last entry
fn same_log(log: &[LogEntry], other: &[LogEntry]) -> bool {
    log.len() == other.len() && log.last() == other.last()
}

struct ReplicaSetState {
    replicas: Vec<Replica>,
    leader: Option<usize>,
    term: u64,
}

impl ReplicaSetState {
    fn up_count(&self) -> usize {
        self.replicas.iter().filter(|r| r.up).count()
    }

    fn position(&self, id: &str) -> Result<usize, ConsensusError> {
        self.replicas
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| ConsensusError::ReplicaNotFound(id.to_string()))
    }

    fn ensure_leader(&mut self, majority: usize) -> Result<usize, ConsensusError> {
        if let Some(idx) = self.leader {
            if self.replicas[idx].up {
                return Ok(idx);
            }
        }
        self.leader = None;

        let up = self.up_count();
        if up < majority {
            return Err(ConsensusError::NoQuorum {
                up,
                needed: majority,
            });
        }
        let idx = self
            .replicas
            .iter()
            .enumerate()
            .filter(|(_, r)| r.up)
            .max_by_key(|(_, r)| (r.last_term(), r.last_index(), r.priority))
            .map(|(i, _)| i)
            .ok_or(ConsensusError::NoQuorum {
                up,
                needed: majority,
            })?;

        self.term += 1;
        self.leader = Some(idx);
        info!(
            "Replica {} elected leader for term {} (last index {})",
            self.replicas[idx].id,
            self.term,
            self.replicas[idx].last_index()
        );
        Ok(idx)
    }
}

/// Config replica set running inside the pilot process
pub struct LocalReplicaSet {
    state: Mutex<ReplicaSetState>,
    majority: usize,
    /// Test hook: the next proposal stops after this many copies and the
    /// leader goes down before the commit mark
    crash_after: parking_lot::Mutex<Option<usize>>,
    replication_delay_ms: AtomicU64,
}

impl LocalReplicaSet {
    /// Open the replica set, loading every replica's log from `dir/<id>/`
    pub async fn open(
        dir: impl AsRef<Path>,
        replicas: &[ReplicaConfig],
    ) -> Result<Self, ConsensusError> {
        if replicas.is_empty() {
            return Err(ConsensusError::NoQuorum { up: 0, needed: 1 });
        }

        let mut loaded = Vec::with_capacity(replicas.len());
        for spec in replicas {
            let storage = FileStorage::new(dir.as_ref().join(&spec.id));
            let log = storage.load_log().await?;
            loaded.push(Replica {
                id: spec.id.clone(),
                priority: spec.priority,
                up: true,
                log,
                storage,
            });
        }
        let term = loaded.iter().map(|r| r.last_term()).max().unwrap_or(0);
        let majority = loaded.len() / 2 + 1;

        info!(
            "Opened config replica set: {} replicas, majority {}, term {}",
            loaded.len(),
            majority,
            term
        );

        Ok(Self {
            state: Mutex::new(ReplicaSetState {
                replicas: loaded,
                leader: None,
                term,
            }),
            majority,
            crash_after: parking_lot::Mutex::new(None),
            replication_delay_ms: AtomicU64::new(0),
        })
    }

    /// Take a replica down. Its in-memory log is dropped on restart.
    pub async fn stop_replica(&self, id: &str) -> Result<(), ConsensusError> {
        let mut state = self.state.lock().await;
        let idx = state.position(id)?;
        state.replicas[idx].up = false;
        if state.leader == Some(idx) {
            state.leader = None;
        }
        info!("Config replica {} stopped", id);
        Ok(())
    }

    /// Bring a replica back: reload its log from disk, then catch up from
    /// the current leader.
    pub async fn start_replica(&self, id: &str) -> Result<(), ConsensusError> {
        let mut state = self.state.lock().await;
        let idx = state.position(id)?;
        let log = state.replicas[idx].storage.load_log().await?;
        state.replicas[idx].log = log;
        state.replicas[idx].up = true;

        if let Some(leader) = state.leader {
            if leader != idx && state.replicas[leader].up {
                let leader_log = state.replicas[leader].log.clone();
                let replica = &mut state.replicas[idx];
                if !same_log(&replica.log, &leader_log) {
                    replica.log = leader_log;
                    replica.persist().await?;
                    info!(
                        "Config replica {} caught up to index {}",
                        id,
                        replica.last_index()
                    );
                }
            }
        }
        info!("Config replica {} started", id);
        Ok(())
    }

    /// Leader without triggering an election
    pub async fn leader_id(&self) -> Option<ReplicaId> {
        let state = self.state.lock().await;
        state.leader.map(|idx| state.replicas[idx].id.clone())
    }

    pub async fn up_replicas(&self) -> Vec<ReplicaId> {
        let state = self.state.lock().await;
        state
            .replicas
            .iter()
            .filter(|r| r.up)
            .map(|r| r.id.clone())
            .collect()
    }

    /// In-memory log of one replica
    pub async fn replica_log(&self, id: &str) -> Result<Vec<LogEntry>, ConsensusError> {
        let state = self.state.lock().await;
        let idx = state.position(id)?;
        Ok(state.replicas[idx].log.clone())
    }

    /// Make the next proposal reach only `copies` replicas (leader first),
    /// then take the leader down before it marks the entry committed.
    pub fn crash_leader_after(&self, copies: usize) {
        *self.crash_after.lock() = Some(copies);
    }

    /// Delay applied before every replica append
    pub fn set_replication_delay(&self, delay: Duration) {
        self.replication_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn replication_delay(&self) -> Duration {
        Duration::from_millis(self.replication_delay_ms.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl Consensus for LocalReplicaSet {
    async fn current_leader(&self) -> Result<Leadership, ConsensusError> {
        let mut state = self.state.lock().await;
        let idx = state.ensure_leader(self.majority)?;
        Ok(Leadership {
            leader: state.replicas[idx].id.clone(),
            term: state.term,
        })
    }

    async fn propose_and_await_majority(
        &self,
        change: MetadataChange,
    ) -> Result<LogEntry, ConsensusError> {
        let mut state = self.state.lock().await;
        let leader = state.ensure_leader(self.majority)?;
        if let Some(pending) = state.replicas[leader].log.iter().find(|e| !e.is_committed()) {
            return Err(ConsensusError::PendingEntries(pending.index));
        }

        let prefix = state.replicas[leader].log.clone();
        let entry = LogEntry {
            index: state.replicas[leader].last_index() + 1,
            term: state.term,
            change,
            acks: 0,
            status: EntryStatus::Pending,
        };
        let crash_after = self.crash_after.lock().take();
        let delay = self.replication_delay();

        let mut order = vec![leader];
        order.extend((0..state.replicas.len()).filter(|i| *i != leader && state.replicas[*i].up));

        let mut holders = Vec::with_capacity(order.len());
        for idx in order {
            if crash_after.map_or(false, |limit| holders.len() >= limit) {
                break;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let replica = &mut state.replicas[idx];
            if idx != leader && !same_log(&replica.log, &prefix) {
                replica.log = prefix.clone();
            }
            replica.log.push(entry.clone());
            replica.persist().await?;
            holders.push(idx);
        }

        if crash_after.is_some() {
            let id = state.replicas[leader].id.clone();
            state.replicas[leader].up = false;
            state.leader = None;
            warn!(
                "Leader {} went down before committing entry {} ({} copies)",
                id,
                entry.index,
                holders.len()
            );
            return Err(ConsensusError::LeaderLost(id));
        }

        if holders.len() < self.majority {
            for idx in &holders {
                let replica = &mut state.replicas[*idx];
                replica.log.retain(|e| e.index != entry.index);
                replica.persist().await?;
            }
            return Err(ConsensusError::NoQuorum {
                up: holders.len(),
                needed: self.majority,
            });
        }

        let acks = holders.len();
        for idx in &holders {
            let replica = &mut state.replicas[*idx];
            if let Some(e) = replica.entry_mut(entry.index) {
                e.status = EntryStatus::Committed;
                e.acks = acks;
            }
            replica.persist().await?;
        }
        debug!("Entry {} committed with {} acks", entry.index, acks);

        Ok(LogEntry {
            acks,
            status: EntryStatus::Committed,
            ..entry
        })
    }

    async fn local_log(&self) -> Result<Vec<LogEntry>, ConsensusError> {
        let mut state = self.state.lock().await;
        let leader = state.ensure_leader(self.majority)?;
        Ok(state.replicas[leader].log.clone())
    }

    async fn acknowledgements(&self, index: u64) -> Result<usize, ConsensusError> {
        let mut state = self.state.lock().await;
        let leader = state.ensure_leader(self.majority)?;
        let entry = state.replicas[leader]
            .entry(index)
            .cloned()
            .ok_or(ConsensusError::EntryNotFound(index))?;
        Ok(state
            .replicas
            .iter()
            .filter(|r| r.up && r.holds(&entry))
            .count())
    }

    async fn commit_pending(&self, index: u64) -> Result<LogEntry, ConsensusError> {
        let mut state = self.state.lock().await;
        let leader = state.ensure_leader(self.majority)?;
        let entry = state.replicas[leader]
            .entry(index)
            .cloned()
            .ok_or(ConsensusError::EntryNotFound(index))?;
        if entry.is_committed() {
            return Ok(entry);
        }

        let acks = state
            .replicas
            .iter()
            .filter(|r| r.up && r.holds(&entry))
            .count();
        let committed = LogEntry {
            acks,
            status: EntryStatus::Committed,
            ..entry
        };

        let upto: Vec<LogEntry> = state.replicas[leader]
            .log
            .iter()
            .filter(|e| e.index < index)
            .cloned()
            .chain(std::iter::once(committed.clone()))
            .collect();

        for idx in 0..state.replicas.len() {
            let replica = &mut state.replicas[idx];
            if !replica.up {
                continue;
            }
            if replica.holds(&committed) {
                if let Some(e) = replica.entry_mut(index) {
                    e.status = EntryStatus::Committed;
                    e.acks = acks;
                }
            } else {
                replica.log = upto.clone();
            }
            replica.persist().await?;
        }
        Ok(committed)
    }

    async fn discard_pending(&self, from_index: u64) -> Result<usize, ConsensusError> {
        let mut state = self.state.lock().await;
        let leader = state.ensure_leader(self.majority)?;
        let mut dropped_by_leader = 0;
        for idx in 0..state.replicas.len() {
            let replica = &mut state.replicas[idx];
            if !replica.up {
                continue;
            }
            let before = replica.log.len();
            replica
                .log
                .retain(|e| e.is_committed() || e.index < from_index);
            let dropped = before - replica.log.len();
            if dropped > 0 {
                replica.persist().await?;
            }
            if idx == leader {
                dropped_by_leader = dropped;
            }
        }
        Ok(dropped_by_leader)
    }

    async fn members(&self) -> Vec<MemberInfo> {
        let state = self.state.lock().await;
        state
            .replicas
            .iter()
            .enumerate()
            .map(|(idx, r)| MemberInfo {
                id: r.id.clone(),
                priority: r.priority,
                up: r.up,
                is_leader: state.leader == Some(idx),
                last_index: r.last_index(),
                committed_index: r.committed_index(),
            })
            .collect()
    }

    fn majority(&self) -> usize {
        self.majority
    }
}
