//! Lifecycle of an ephemeral background worker.
//!
//! The host may start and kill the worker at will, so the manager keeps
//! nothing that matters only in memory: every transition and every accepted
//! packet is written to the storage collaborator before the call returns.
//!
//! ```text
//! dormant ──start──▶ starting ──activate──▶ active ──terminate──▶ terminating ──▶ dormant
//!    ▲                                        │
//!    └──────────────── host_killed ───────────┘
//! ```

mod storage;

pub use storage::{FileStorage, MemoryStorage, PersistentStorage};

use serde::{Deserialize, Serialize};

use crate::error::{CrxError, CrxResult};
use crate::hmr::UpdatePacket;

/// Storage key holding the lifecycle snapshot.
pub const STATE_KEY: &str = "crxkit:worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Dormant,
    Starting,
    Active,
    Terminating,
}

/// What happened to a submitted packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Send this packet to the worker now.
    Deliver(UpdatePacket),
    /// An apply is in flight; the packet was folded into the next re-apply.
    Coalesced,
    /// The worker is not running; the packet replays on activation.
    Deferred,
}

/// Durable part of the lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Snapshot {
    state: WorkerState,
    /// Whether a delivered packet has not been acknowledged yet.
    in_flight: bool,
    /// Coalesced re-apply waiting for the in-flight apply.
    pending: Option<UpdatePacket>,
    /// Packets received while the worker was not running.
    deferred: Option<UpdatePacket>,
    activations: u64,
}

/// State machine over the background worker.
pub struct WorkerLifecycle<S: PersistentStorage> {
    storage: S,
    snapshot: Snapshot,
}

impl<S: PersistentStorage> WorkerLifecycle<S> {
    /// Create a manager for a worker that is not running.
    ///
    /// Nothing is read from storage until [`start`](Self::start).
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            snapshot: Snapshot::default(),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.snapshot.state
    }

    /// Number of times the worker reached `active`.
    pub fn activations(&self) -> u64 {
        self.snapshot.activations
    }

    pub fn is_applying(&self) -> bool {
        self.snapshot.in_flight
    }

    /// `dormant → starting`: restore state from storage.
    ///
    /// Work that was not acknowledged before the worker went away is carried
    /// into the deferred packet. An empty store is a cold install.
    pub fn start(&mut self) -> CrxResult<()> {
        self.expect_state(WorkerState::Dormant, "start")?;

        let mut restored: Snapshot = match self.storage.get(STATE_KEY)? {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable worker state: {}", e);
                Snapshot::default()
            }),
            None => Snapshot::default(),
        };

        restored.deferred = merge(restored.deferred.take(), restored.pending.take());
        restored.in_flight = false;
        restored.state = WorkerState::Starting;

        self.snapshot = restored;
        self.commit()
    }

    /// `starting → active`. Returns the deferred packet to replay, if any.
    pub fn activate(&mut self) -> CrxResult<Option<UpdatePacket>> {
        self.expect_state(WorkerState::Starting, "activate")?;

        self.snapshot.state = WorkerState::Active;
        self.snapshot.activations += 1;
        let replay = self.snapshot.deferred.take();
        self.snapshot.in_flight = replay.is_some();
        self.commit()?;

        Ok(replay)
    }

    /// Accept a packet for the worker.
    pub fn submit(&mut self, packet: UpdatePacket) -> CrxResult<Submission> {
        let outcome = match self.snapshot.state {
            WorkerState::Active if !self.snapshot.in_flight => {
                self.snapshot.in_flight = true;
                Submission::Deliver(packet)
            }
            WorkerState::Active => {
                self.snapshot.pending = merge(self.snapshot.pending.take(), Some(packet));
                Submission::Coalesced
            }
            WorkerState::Dormant | WorkerState::Starting | WorkerState::Terminating => {
                self.snapshot.deferred = merge(self.snapshot.deferred.take(), Some(packet));
                Submission::Deferred
            }
        };

        self.commit()?;
        Ok(outcome)
    }

    /// The worker acknowledged the in-flight apply. Returns the coalesced
    /// re-apply to send next, if any.
    pub fn applied(&mut self) -> CrxResult<Option<UpdatePacket>> {
        if self.snapshot.state != WorkerState::Active {
            return Ok(None);
        }

        let next = self.snapshot.pending.take();
        self.snapshot.in_flight = next.is_some();
        self.commit()?;

        Ok(next)
    }

    /// `active → terminating → dormant`, committing outstanding work first.
    pub fn terminate(&mut self) -> CrxResult<()> {
        self.expect_state(WorkerState::Active, "terminate")?;

        self.snapshot.state = WorkerState::Terminating;
        self.snapshot.deferred = merge(self.snapshot.deferred.take(), self.snapshot.pending.take());
        self.commit()?;

        self.snapshot.state = WorkerState::Dormant;
        self.snapshot.in_flight = false;
        self.commit()
    }

    /// The host killed the worker without notice.
    ///
    /// An in-flight packet counts as consumed: the worker reloads its bundle
    /// from disk when it comes back.
    pub fn host_killed(&mut self) -> CrxResult<()> {
        if self.snapshot.state == WorkerState::Dormant {
            return Ok(());
        }

        self.snapshot.deferred = merge(self.snapshot.deferred.take(), self.snapshot.pending.take());
        self.snapshot.in_flight = false;
        self.snapshot.state = WorkerState::Dormant;
        self.commit()
    }

    fn expect_state(&self, expected: WorkerState, operation: &str) -> CrxResult<()> {
        if self.snapshot.state == expected {
            Ok(())
        } else {
            Err(CrxError::Lifecycle(format!(
                "cannot {} a {:?} worker",
                operation, self.snapshot.state
            )))
        }
    }

    fn commit(&mut self) -> CrxResult<()> {
        let value = serde_json::to_value(&self.snapshot)?;
        self.storage.set(STATE_KEY, value)
    }
}

fn merge(older: Option<UpdatePacket>, newer: Option<UpdatePacket>) -> Option<UpdatePacket> {
    match (older, newer) {
        (Some(older), Some(newer)) => Some(older.coalesce(newer)),
        (older, newer) => older.or(newer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmr::{ModuleUpdate, PacketKind, Targets};
    use serde_json::Value;

    fn hot(id: &str, code: &str) -> UpdatePacket {
        UpdatePacket::hot_apply(
            Targets::context("background"),
            vec![ModuleUpdate::new(&id.to_string(), "h", code.to_string())],
        )
    }

    fn stored(storage: &MemoryStorage) -> Value {
        storage.get(STATE_KEY).unwrap().unwrap()
    }

    fn active(storage: &MemoryStorage) -> WorkerLifecycle<MemoryStorage> {
        let mut worker = WorkerLifecycle::new(storage.clone());
        worker.start().unwrap();
        assert_eq!(worker.activate().unwrap(), None);
        worker
    }

    #[test]
    fn test_full_cycle() {
        let storage = MemoryStorage::new();
        let mut worker = WorkerLifecycle::new(storage.clone());
        assert_eq!(worker.state(), WorkerState::Dormant);

        worker.start().unwrap();
        assert_eq!(worker.state(), WorkerState::Starting);
        assert_eq!(stored(&storage)["state"], "starting");

        worker.activate().unwrap();
        assert_eq!(worker.state(), WorkerState::Active);
        assert_eq!(worker.activations(), 1);

        worker.terminate().unwrap();
        assert_eq!(worker.state(), WorkerState::Dormant);
        assert_eq!(stored(&storage)["state"], "dormant");
    }

    #[test]
    fn test_invalid_transitions() {
        let storage = MemoryStorage::new();
        let mut worker = WorkerLifecycle::new(storage);
        assert!(matches!(worker.activate(), Err(CrxError::Lifecycle(_))));
        assert!(matches!(worker.terminate(), Err(CrxError::Lifecycle(_))));

        worker.start().unwrap();
        assert!(worker.start().is_err());
    }

    #[test]
    fn test_terminate_commits_pending_writes() {
        let storage = MemoryStorage::new();
        let mut worker = active(&storage);

        assert!(matches!(worker.submit(hot("a.ts", "1")).unwrap(), Submission::Deliver(_)));
        assert_eq!(worker.submit(hot("a.ts", "2")).unwrap(), Submission::Coalesced);

        worker.terminate().unwrap();

        // Storage already holds the coalesced packet without any further call
        let snapshot = stored(&storage);
        assert_eq!(snapshot["state"], "dormant");
        assert_eq!(snapshot["deferred"]["modules"][0]["code"], "2");
        assert!(snapshot["pending"].is_null());
    }

    #[test]
    fn test_cold_start_matches_fresh_install() {
        let fresh_storage = MemoryStorage::new();
        let mut fresh = WorkerLifecycle::new(fresh_storage.clone());
        fresh.start().unwrap();
        let fresh_replay = fresh.activate().unwrap();

        // Restart after a clean shutdown with nothing outstanding
        let storage = MemoryStorage::new();
        let mut first = active(&storage);
        first.terminate().unwrap();
        drop(first);

        let mut restarted = WorkerLifecycle::new(storage.clone());
        restarted.start().unwrap();
        let replay = restarted.activate().unwrap();

        assert_eq!(replay, fresh_replay);
        assert_eq!(restarted.state(), fresh.state());
        assert!(!restarted.is_applying());
        assert_eq!(restarted.submit(hot("a.ts", "x")).unwrap(), fresh.submit(hot("a.ts", "x")).unwrap());
    }

    #[test]
    fn test_coalesces_while_applying() {
        let storage = MemoryStorage::new();
        let mut worker = active(&storage);

        let first = worker.submit(hot("a.ts", "1")).unwrap();
        assert_eq!(first, Submission::Deliver(hot("a.ts", "1")));
        assert_eq!(worker.submit(hot("a.ts", "2")).unwrap(), Submission::Coalesced);
        assert_eq!(worker.submit(hot("b.ts", "3")).unwrap(), Submission::Coalesced);

        let reapply = worker.applied().unwrap().unwrap();
        let codes: Vec<_> = reapply.modules.iter().map(|m| m.code.as_str()).collect();
        assert_eq!(codes, vec!["2", "3"]);
        assert!(worker.is_applying());

        assert_eq!(worker.applied().unwrap(), None);
        assert!(!worker.is_applying());
    }

    #[test]
    fn test_full_reload_dominates_coalesced() {
        let storage = MemoryStorage::new();
        let mut worker = active(&storage);

        worker.submit(hot("a.ts", "1")).unwrap();
        worker.submit(hot("a.ts", "2")).unwrap();
        worker
            .submit(UpdatePacket::full_reload(Targets::Broadcast))
            .unwrap();
        worker.submit(hot("b.ts", "3")).unwrap();

        let reapply = worker.applied().unwrap().unwrap();
        assert_eq!(reapply.kind, PacketKind::FullReload);
    }

    #[test]
    fn test_deferred_while_dormant_replays_once() {
        let storage = MemoryStorage::new();
        let mut worker = WorkerLifecycle::new(storage.clone());

        assert_eq!(worker.submit(hot("a.ts", "1")).unwrap(), Submission::Deferred);
        assert_eq!(worker.submit(hot("a.ts", "2")).unwrap(), Submission::Deferred);

        // A new manager instance sees the same deferred work
        let mut restarted = WorkerLifecycle::new(storage.clone());
        restarted.start().unwrap();
        let replay = restarted.activate().unwrap().unwrap();
        assert_eq!(replay.modules[0].code, "2");
        assert!(restarted.is_applying());

        restarted.applied().unwrap();
        restarted.host_killed().unwrap();
        restarted.start().unwrap();
        assert_eq!(restarted.activate().unwrap(), None);
    }

    #[test]
    fn test_host_kill_keeps_coalesced_work() {
        let storage = MemoryStorage::new();
        let mut worker = active(&storage);

        worker.submit(hot("a.ts", "1")).unwrap();
        worker.submit(hot("a.ts", "2")).unwrap();
        worker.host_killed().unwrap();
        assert_eq!(worker.state(), WorkerState::Dormant);

        worker.start().unwrap();
        let replay = worker.activate().unwrap().unwrap();
        assert_eq!(replay.modules[0].code, "2");
    }

    #[test]
    fn test_unreadable_snapshot_is_cold_start() {
        let mut storage = MemoryStorage::new();
        storage.set(STATE_KEY, Value::String("garbage".into())).unwrap();

        let mut worker = WorkerLifecycle::new(storage);
        worker.start().unwrap();
        assert_eq!(worker.activate().unwrap(), None);
        assert_eq!(worker.activations(), 1);
    }
}
