/// Applies committed raft entries to the user log. `Append` commands land
/// as new records; `JoinCluster` commands are recorded for audit only,
/// since membership changes actually flow through openraft's own
/// joint-consensus protocol (`Raft::add_learner`/`change_membership`).
use std::{io::Cursor, sync::Arc};

use openraft::{
  storage::RaftStateMachine, BasicNode, EntryPayload, LogId, RaftSnapshotBuilder, Snapshot,
  SnapshotMeta, StorageError, StoredMembership,
};
use prost::Message;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info};

use super::type_config::{Command, CommandResponse, NodeId, TypeConfig};
use crate::{api::v1::Record, log::Log};

pub struct StateMachine {
  user_log: Arc<Log>,
  last_applied_log: Arc<RwLock<Option<LogId<NodeId>>>>,
  last_membership: Arc<RwLock<StoredMembership<NodeId, BasicNode>>>,
  new_record: Arc<Notify>,
}

impl StateMachine {
  pub fn new(user_log: Arc<Log>, new_record: Arc<Notify>) -> Self {
    Self {
      user_log,
      last_applied_log: Arc::new(RwLock::new(None)),
      last_membership: Arc::new(RwLock::new(StoredMembership::default())),
      new_record,
    }
  }

  fn apply_command(&self, command: Command) -> CommandResponse {
    match command {
      Command::Append { value } => match self.user_log.append(value) {
        Ok(offset) => {
          self.new_record.notify_waiters();
          CommandResponse::Appended { offset }
        }
        Err(err) => {
          tracing::error!(%err, "failed to apply committed append");
          CommandResponse::Acknowledged
        }
      },
      Command::JoinCluster {
        server_id,
        rpc_addr,
        voter,
      } => {
        debug!(server_id, rpc_addr, voter, "join-cluster command applied (audit only)");
        CommandResponse::Acknowledged
      }
    }
  }
}

impl RaftStateMachine<TypeConfig> for StateMachine {
  type SnapshotBuilder = SnapshotBuilder;

  async fn applied_state(
    &mut self,
  ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>> {
    Ok((
      *self.last_applied_log.read().await,
      self.last_membership.read().await.clone(),
    ))
  }

  async fn apply<I>(&mut self, entries: I) -> Result<Vec<CommandResponse>, StorageError<NodeId>>
  where
    I: IntoIterator<Item = openraft::Entry<TypeConfig>> + Send,
  {
    let mut responses = Vec::new();

    for entry in entries {
      *self.last_applied_log.write().await = Some(entry.log_id);

      match entry.payload {
        EntryPayload::Blank => responses.push(CommandResponse::Acknowledged),
        EntryPayload::Normal(command) => responses.push(self.apply_command(command)),
        EntryPayload::Membership(membership) => {
          *self.last_membership.write().await =
            StoredMembership::new(Some(entry.log_id), membership);
          responses.push(CommandResponse::Acknowledged);
        }
      }
    }

    Ok(responses)
  }

  async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
    SnapshotBuilder {
      user_log: self.user_log.clone(),
      last_applied_log: self.last_applied_log.clone(),
      last_membership: self.last_membership.clone(),
    }
  }

  async fn begin_receiving_snapshot(&mut self) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
    Ok(Box::new(Cursor::new(Vec::new())))
  }

  async fn install_snapshot(
    &mut self,
    meta: &SnapshotMeta<NodeId, BasicNode>,
    snapshot: Box<Cursor<Vec<u8>>>,
  ) -> Result<(), StorageError<NodeId>> {
    info!(snapshot_id = %meta.snapshot_id, "installing snapshot");

    let bytes = snapshot.into_inner();
    let records = decode_records(&bytes);

    let initial_offset = records.first().map(|record| record.offset).unwrap_or(0);

    self
      .user_log
      .reset_with_initial_offset(initial_offset)
      .map_err(|err| StorageError::IO {
        source: openraft::StorageIOError::write_snapshot(None, &std::io::Error::other(err.to_string())),
      })?;

    for record in records {
      self
        .user_log
        .append_record(record)
        .map_err(|err| StorageError::IO {
          source: openraft::StorageIOError::write_snapshot(
            None,
            &std::io::Error::other(err.to_string()),
          ),
        })?;
    }

    *self.last_applied_log.write().await = meta.last_log_id;
    *self.last_membership.write().await = meta.last_membership.clone();

    self.new_record.notify_waiters();

    Ok(())
  }

  async fn get_current_snapshot(&mut self) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
    Ok(None)
  }
}

/// Splits a `[len:u64 big-endian][payload]`-framed byte stream (the exact
/// format `Store` writes) back into `Record`s.
fn decode_records(bytes: &[u8]) -> Vec<Record> {
  let mut records = Vec::new();
  let mut cursor = 0usize;

  while cursor + 8 <= bytes.len() {
    let mut len_buf = [0u8; 8];
    len_buf.copy_from_slice(&bytes[cursor..cursor + 8]);
    let len = u64::from_be_bytes(len_buf) as usize;

    let payload_start = cursor + 8;
    let payload_end = payload_start + len;

    if payload_end > bytes.len() {
      break;
    }

    if let Ok(record) = Record::decode(&bytes[payload_start..payload_end]) {
      records.push(record);
    }

    cursor = payload_end;
  }

  records
}

pub struct SnapshotBuilder {
  user_log: Arc<Log>,
  last_applied_log: Arc<RwLock<Option<LogId<NodeId>>>>,
  last_membership: Arc<RwLock<StoredMembership<NodeId, BasicNode>>>,
}

impl RaftSnapshotBuilder<TypeConfig> for SnapshotBuilder {
  async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
    use std::io::Read;

    let last_applied_log = *self.last_applied_log.read().await;
    let last_membership = self.last_membership.read().await.clone();

    let mut buffer = Vec::new();
    self
      .user_log
      .reader()
      .map_err(|err| StorageError::IO {
        source: openraft::StorageIOError::read_snapshot(None, &std::io::Error::other(err.to_string())),
      })?
      .read_to_end(&mut buffer)
      .map_err(|err| StorageError::IO {
        source: openraft::StorageIOError::read_snapshot(None, &err),
      })?;

    let snapshot_id = format!(
      "{}-{}",
      last_applied_log.map(|id| id.index).unwrap_or(0),
      last_applied_log.map(|id| id.leader_id.term).unwrap_or_default(),
    );

    let meta = SnapshotMeta {
      last_log_id: last_applied_log,
      last_membership,
      snapshot_id,
    };

    Ok(Snapshot {
      meta,
      snapshot: Box::new(Cursor::new(buffer)),
    })
  }
}
