/// Raft's own log store. Entries live in an in-memory `BTreeMap` for fast
/// range scans and suffix truncation (neither of which the append-only
/// segmented `Log` supports directly), mirrored onto a segmented `Log`
/// opened under the data directory's `raft/` subdirectory so the entries
/// survive a restart — the same file conventions the user log uses.
///
/// Prefix compaction (`purge`) maps directly onto `Log::truncate`. Suffix
/// truncation (`truncate`, used to drop conflicting entries after a leader
/// change) only rewinds the in-memory map: our segmented store has no way
/// to delete a trailing byte range out of an already-written segment. A
/// node that crashes between a suffix truncation and its next snapshot may
/// replay a few stale entries into the map on restart; openraft detects the
/// mismatch against the cluster and resyncs via `install_snapshot` /
/// `append_entries`, the same path it uses for any lagging follower.
use std::{collections::BTreeMap, fmt::Debug, ops::RangeBounds, sync::Arc};

use openraft::{
  storage::{LogFlushed, RaftLogReader, RaftLogStorage},
  Entry, LogId, LogState, OptionalSend, StorageError, Vote,
};
use tokio::sync::RwLock;

use super::type_config::{NodeId, TypeConfig};
use crate::log::Log;

pub struct RaftLogStore {
  raft_log: Arc<Log>,
  vote: RwLock<Option<Vote<NodeId>>>,
  entries: RwLock<BTreeMap<u64, Entry<TypeConfig>>>,
  last_purged_log_id: RwLock<Option<LogId<NodeId>>>,
}

fn storage_err(err: impl std::fmt::Display) -> StorageError<NodeId> {
  StorageError::IO {
    source: openraft::StorageIOError::write(&std::io::Error::other(err.to_string())),
  }
}

impl RaftLogStore {
  /// Opens the durability journal and replays every entry it holds into the
  /// in-memory map.
  pub fn open(raft_log: Arc<Log>) -> anyhow::Result<Self> {
    let mut entries = BTreeMap::new();

    if raft_log.highest_offset() > 0 || raft_log.lowest_offset() > 0 {
      for offset in raft_log.lowest_offset()..=raft_log.highest_offset() {
        if let Ok(record) = raft_log.read(offset) {
          if let Ok(entry) = bincode::deserialize::<Entry<TypeConfig>>(&record.value) {
            entries.insert(entry.log_id.index, entry);
          }
        }
      }
    }

    Ok(Self {
      raft_log,
      vote: RwLock::new(None),
      entries: RwLock::new(entries),
      last_purged_log_id: RwLock::new(None),
    })
  }
}

impl RaftLogReader<TypeConfig> for RaftLogStore {
  async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
    &mut self,
    range: RB,
  ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
    let entries = self.entries.read().await;
    Ok(entries.range(range).map(|(_, entry)| entry.clone()).collect())
  }
}

impl RaftLogStorage<TypeConfig> for RaftLogStore {
  type LogReader = RaftLogReaderHandle;

  async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
    let entries = self.entries.read().await;
    let last_purged = *self.last_purged_log_id.read().await;
    let last_log_id = entries.values().next_back().map(|entry| entry.log_id);

    Ok(LogState {
      last_purged_log_id: last_purged,
      last_log_id,
    })
  }

  async fn get_log_reader(&mut self) -> Self::LogReader {
    RaftLogReaderHandle {
      entries: self.entries.read().await.clone(),
    }
  }

  async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
    *self.vote.write().await = Some(*vote);
    Ok(())
  }

  async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
    Ok(*self.vote.read().await)
  }

  async fn append<I>(
    &mut self,
    new_entries: I,
    callback: LogFlushed<TypeConfig>,
  ) -> Result<(), StorageError<NodeId>>
  where
    I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
  {
    let mut entries = self.entries.write().await;

    for entry in new_entries {
      let encoded = bincode::serialize(&entry).map_err(storage_err)?;
      self.raft_log.append(encoded).map_err(storage_err)?;
      entries.insert(entry.log_id.index, entry);
    }

    callback.log_io_completed(Ok(()));

    Ok(())
  }

  async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
    let mut entries = self.entries.write().await;
    let stale: Vec<u64> = entries.range(log_id.index..).map(|(index, _)| *index).collect();

    for index in stale {
      entries.remove(&index);
    }

    Ok(())
  }

  async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
    let mut entries = self.entries.write().await;
    let stale: Vec<u64> = entries.range(..=log_id.index).map(|(index, _)| *index).collect();

    for index in stale {
      entries.remove(&index);
    }

    *self.last_purged_log_id.write().await = Some(log_id);

    // `log_id.index` is openraft's 1-based index (index 0 reserved); the
    // journal's own offsets are 0-based and assigned 1:1 by `append` above,
    // so offset `N` corresponds to `log_id.index == N + 1`. Translate before
    // handing it to `Log::truncate`, which removes every segment whose
    // highest offset does not exceed the value passed in.
    self
      .raft_log
      .truncate(log_id.index.saturating_sub(1))
      .map_err(storage_err)?;

    Ok(())
  }
}

/// A point-in-time snapshot of the entry map, cheap to clone since entries
/// are read-mostly once committed.
pub struct RaftLogReaderHandle {
  entries: BTreeMap<u64, Entry<TypeConfig>>,
}

impl RaftLogReader<TypeConfig> for RaftLogReaderHandle {
  async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
    &mut self,
    range: RB,
  ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
    Ok(self.entries.range(range).map(|(_, entry)| entry.clone()).collect())
  }
}
