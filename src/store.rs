//! Raft storage: in-memory log plus the engine-backed state machine.
//!
//! [`KvStore`] is a combined openraft v1 `RaftStorage` implementation,
//! bridged into the v2 `RaftLogStorage` + `RaftStateMachine` split with
//! `openraft::storage::Adaptor::new(store)`. The log, vote, and membership
//! live in memory; committed operations are applied to the shared
//! [`StorageEngine`], which is the durable state.
//!
//! Apply is the only mutation path into the engine. Entries arrive in
//! commit order, identical on every peer, so the engine needs no locking
//! beyond its own. A committed entry that fails to decode means the log is
//! corrupt; the process aborts rather than diverge.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;

use openraft::storage::{RaftLogReader, RaftSnapshotBuilder, RaftStorage};
use openraft::{
    Entry, EntryPayload, LogId, LogState, RaftLogId, Snapshot, SnapshotMeta, StorageError,
    StoredMembership, Vote,
};
use tokio::sync::watch;
use tracing::{debug, error};

use crate::engine::StorageEngine;
use crate::operation::{Operation, OperationKind};
use crate::raft::{ApplyResponse, NodeId, PeerNode, TypeConfig};
use crate::types::ENGINE_OK;

/// Combined in-memory raft storage over a shared engine.
pub struct KvStore {
    vote: Option<Vote<NodeId>>,
    log: BTreeMap<u64, Entry<TypeConfig>>,
    committed: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, PeerNode>,
    snapshot: Option<Snapshot<TypeConfig>>,
    engine: Arc<dyn StorageEngine>,
    /// Fires with the index of every applied entry, for observers that
    /// need to watch state machine progress.
    applied_tx: watch::Sender<u64>,
}

impl KvStore {
    /// Create a store over `engine`, returning it with a receiver that
    /// tracks the last applied log index.
    pub fn new(engine: Arc<dyn StorageEngine>) -> (Self, watch::Receiver<u64>) {
        let (applied_tx, applied_rx) = watch::channel(0);
        let store = Self {
            vote: None,
            log: BTreeMap::new(),
            committed: None,
            last_purged: None,
            last_applied: None,
            last_membership: StoredMembership::default(),
            snapshot: None,
            engine,
            applied_tx,
        };
        (store, applied_rx)
    }

    fn apply_operation(&self, bytes: &[u8], index: u64) -> ApplyResponse {
        let op = match Operation::decode(bytes) {
            Ok(op) => op,
            Err(e) => {
                // Committed entries are trusted; a decode failure means the
                // log is corrupt and continuing would diverge the replicas.
                error!(index, error = %e, "corrupt committed log entry");
                panic!("corrupt committed log entry at index {index}: {e}");
            }
        };

        let engine_rc = match (op.kind(), op.value()) {
            (OperationKind::Put, Some(value)) => self.engine.insert(op.key(), value),
            (OperationKind::Update, Some(value)) => self.engine.update(op.key(), value),
            (OperationKind::Delete, _) => self.engine.delete(op.key()),
            _ => unreachable!("decode guarantees a value for PUT and UPDATE"),
        };

        debug!(index, kind = ?op.kind(), engine_rc, "applied operation");
        ApplyResponse { engine_rc }
    }
}

// RaftStorage v1 requires KvStore to implement RaftLogReader directly
// (because RaftStorage: RaftLogReader). Plain async fn, no #[async_trait]:
// openraft traits use RPITIT.
impl RaftLogReader<TypeConfig> for KvStore {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Log reader backed by a snapshot of the log at a point in time.
pub struct KvLogReader {
    log: BTreeMap<u64, Entry<TypeConfig>>,
}

impl RaftLogReader<TypeConfig> for KvLogReader {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Snapshot builder: serializes the full keyspace as JSON pairs.
pub struct KvSnapshotBuilder {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, PeerNode>,
    engine: Arc<dyn StorageEngine>,
}

impl RaftSnapshotBuilder<TypeConfig> for KvSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let pairs = self.engine.iter_all().unwrap_or_default();
        let data = serde_json::to_vec(&pairs).unwrap_or_default();

        let snap_id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .to_string();

        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: self.last_applied,
                last_membership: self.last_membership.clone(),
                snapshot_id: snap_id,
            },
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

/// openraft v1 `RaftStorage` implementation. Method names follow the v1
/// API (`append_to_log`, `delete_conflict_logs_since`, `purge_logs_upto`,
/// `apply_to_state_machine`).
impl RaftStorage<TypeConfig> for KvStore {
    type LogReader = KvLogReader;
    type SnapshotBuilder = KvSnapshotBuilder;

    // ── Vote ──────────────────────────────────────────────────────────────────

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.vote)
    }

    // ── Log ───────────────────────────────────────────────────────────────────

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last = self.log.values().next_back().map(|e| *e.get_log_id());
        Ok(LogState {
            last_purged_log_id: self.last_purged,
            last_log_id: last,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.committed)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        KvLogReader {
            log: self.log.clone(),
        }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        for entry in entries {
            self.log.insert(entry.get_log_id().index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx < log_id.index);
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx > log_id.index);
        self.last_purged = Some(log_id);
        Ok(())
    }

    // ── State machine ─────────────────────────────────────────────────────────

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, PeerNode>), StorageError<NodeId>>
    {
        Ok((self.last_applied, self.last_membership.clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<ApplyResponse>, StorageError<NodeId>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            self.last_applied = Some(*entry.get_log_id());
            let index = entry.get_log_id().index;

            let response = match &entry.payload {
                EntryPayload::Blank => ApplyResponse {
                    engine_rc: ENGINE_OK,
                },
                EntryPayload::Normal(encoded) => self.apply_operation(&encoded.0, index),
                EntryPayload::Membership(m) => {
                    self.last_membership =
                        StoredMembership::new(Some(*entry.get_log_id()), m.clone());
                    ApplyResponse {
                        engine_rc: ENGINE_OK,
                    }
                }
            };

            let _ = self.applied_tx.send(index);
            responses.push(response);
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        KvSnapshotBuilder {
            last_applied: self.last_applied,
            last_membership: self.last_membership.clone(),
            engine: self.engine.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, PeerNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let pairs: Vec<(Vec<u8>, Vec<u8>)> =
            serde_json::from_slice(snapshot.get_ref()).unwrap_or_default();
        self.engine.replace_all(pairs);

        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();
        self.snapshot = Some(Snapshot {
            meta: meta.clone(),
            snapshot,
        });
        if let Some(log_id) = meta.last_log_id {
            let _ = self.applied_tx.send(log_id.index);
        }
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        match &self.snapshot {
            Some(snap) => Ok(Some(Snapshot {
                meta: snap.meta.clone(),
                snapshot: Box::new(Cursor::new(snap.snapshot.get_ref().clone())),
            })),
            None => Ok(None),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineConfig, SledEngine};
    use crate::raft::EncodedOperation;
    use crate::types::ENGINE_KEY_NOT_FOUND;
    use openraft::CommittedLeaderId;

    fn temp_store() -> (KvStore, watch::Receiver<u64>, Arc<dyn StorageEngine>, tempfile::TempDir)
    {
        let dir = tempfile::tempdir().unwrap();
        let engine: Arc<dyn StorageEngine> = Arc::new(
            SledEngine::open(&EngineConfig {
                path: dir.path().join("db").to_string_lossy().into_owned(),
                cache_size: 1024 * 1024,
                max_key_size: 64,
                disk_size: 0,
            })
            .unwrap(),
        );
        let (store, applied_rx) = KvStore::new(engine.clone());
        (store, applied_rx, engine, dir)
    }

    fn normal_entry(index: u64, op: Operation) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(EncodedOperation(op.encode())),
        }
    }

    #[tokio::test]
    async fn vote_roundtrip() {
        let (mut store, _rx, _engine, _dir) = temp_store();
        let vote = Vote::new(1, 42);
        store.save_vote(&vote).await.unwrap();
        assert_eq!(store.read_vote().await.unwrap(), Some(vote));
    }

    #[tokio::test]
    async fn initial_log_state_is_empty() {
        let (mut store, _rx, _engine, _dir) = temp_store();
        let state = store.get_log_state().await.unwrap();
        assert!(state.last_log_id.is_none());
        assert!(state.last_purged_log_id.is_none());
    }

    #[tokio::test]
    async fn apply_put_reaches_engine() {
        let (mut store, mut rx, engine, _dir) = temp_store();

        let entry = normal_entry(1, Operation::put(&b"k"[..], &b"v"[..]));
        let responses = store.apply_to_state_machine(&[entry]).await.unwrap();
        assert_eq!(responses[0].engine_rc, ENGINE_OK);

        let (value, rc) = engine.lookup(b"k");
        assert_eq!(rc, ENGINE_OK);
        assert_eq!(value.as_deref(), Some(&b"v"[..]));

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
    }

    #[tokio::test]
    async fn apply_preserves_log_order() {
        let (mut store, _rx, engine, _dir) = temp_store();

        let entries = vec![
            normal_entry(1, Operation::put(&b"k"[..], &b"first"[..])),
            normal_entry(2, Operation::put(&b"k"[..], &b"second"[..])),
            normal_entry(3, Operation::delete(&b"other"[..])),
        ];
        let responses = store.apply_to_state_machine(&entries).await.unwrap();
        assert_eq!(responses.len(), 3);

        // The later entry wins: index order is apply order.
        let (value, _) = engine.lookup(b"k");
        assert_eq!(value.as_deref(), Some(&b"second"[..]));
    }

    #[tokio::test]
    async fn apply_surfaces_engine_rc_verbatim() {
        let (mut store, _rx, _engine, _dir) = temp_store();

        let entry = normal_entry(1, Operation::update(&b"absent"[..], &b"v"[..]));
        let responses = store.apply_to_state_machine(&[entry]).await.unwrap();
        assert_eq!(responses[0].engine_rc, ENGINE_KEY_NOT_FOUND);
    }

    #[tokio::test]
    #[should_panic(expected = "corrupt committed log entry")]
    async fn corrupt_entry_aborts() {
        let (mut store, _rx, _engine, _dir) = temp_store();
        let entry = Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), 1),
            payload: EntryPayload::Normal(EncodedOperation(vec![0xFF, 0x01])),
        };
        let _ = store.apply_to_state_machine(&[entry]).await;
    }

    #[tokio::test]
    async fn snapshot_roundtrip_restores_engine_contents() {
        let (mut store, _rx, _engine, _dir) = temp_store();
        let entries = vec![
            normal_entry(1, Operation::put(&b"a"[..], &b"1"[..])),
            normal_entry(2, Operation::put(&b"b"[..], &b"2"[..])),
        ];
        store.apply_to_state_machine(&entries).await.unwrap();

        let mut builder = store.get_snapshot_builder().await;
        let snap = builder.build_snapshot().await.unwrap();

        let (mut other, _rx2, other_engine, _dir2) = temp_store();
        other_engine.insert(b"stale", b"x");
        other.install_snapshot(&snap.meta, snap.snapshot).await.unwrap();

        assert_eq!(other_engine.lookup(b"a").0.as_deref(), Some(&b"1"[..]));
        assert_eq!(other_engine.lookup(b"b").0.as_deref(), Some(&b"2"[..]));
        assert_eq!(other_engine.lookup(b"stale").1, ENGINE_KEY_NOT_FOUND);
        assert!(other.get_current_snapshot().await.unwrap().is_some());
    }
}
