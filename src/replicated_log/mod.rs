/// Wraps the user log behind a consensus state machine: the same
/// append/read contract as `Log`, but `append` only returns once the
/// record has been replicated to a majority of the cluster.
mod log_storage;
mod network;
mod state_machine;
mod type_config;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use openraft::{BasicNode, Raft};
use tokio::{
  io::{AsyncRead, AsyncWrite},
  sync::Notify,
};

pub use network::{serve_connection, RaftRpcRequest, RaftRpcResponse, RAFT_RPC_SENTINEL};
pub use type_config::NodeId;

use crate::{
  api::v1::Record,
  error::CoreError,
  log::Log,
  replicated_log::{
    log_storage::RaftLogStore,
    network::NetworkFactory,
    state_machine::StateMachine,
    type_config::{default_raft_config, Command, TypeConfig},
  },
};

/// The deadline `append` waits for a commit before giving up.
const APPEND_DEADLINE: Duration = Duration::from_secs(10);
/// How long a bootstrap node waits to win its own election.
const BOOTSTRAP_ELECTION_DEADLINE: Duration = Duration::from_secs(3);

pub struct ServerInfo {
  pub id: NodeId,
  pub rpc_addr: String,
  pub is_leader: bool,
}

pub struct ReplicatedLog {
  node_id: NodeId,
  raft: Raft<TypeConfig>,
  user_log: Arc<Log>,
  new_record: Arc<Notify>,
}

impl ReplicatedLog {
  pub async fn new(
    node_id: NodeId,
    rpc_addr: String,
    data_dir: &str,
    segment_config: crate::log::Config,
    tls_client_config: Option<Arc<rustls::ClientConfig>>,
  ) -> anyhow::Result<Arc<Self>> {
    let user_log = Arc::new(Log::new(format!("{data_dir}/log"), segment_config)?);

    let raft_log = Arc::new(Log::new(
      format!("{data_dir}/raft/log"),
      segment_config,
    )?);

    let new_record = Arc::new(Notify::new());

    let log_store = RaftLogStore::open(raft_log)?;
    let state_machine = StateMachine::new(user_log.clone(), new_record.clone());
    let network = NetworkFactory::new(tls_client_config);

    let raft = Raft::new(
      node_id,
      Arc::new(default_raft_config()),
      network,
      log_store,
      state_machine,
    )
    .await?;

    let _ = rpc_addr;

    Ok(Arc::new(Self {
      node_id,
      raft,
      user_log,
      new_record,
    }))
  }

  pub fn raft(&self) -> &Raft<TypeConfig> {
    &self.raft
  }

  /// Bootstraps a single-voter cluster consisting of this node, then blocks
  /// until it wins its own election.
  pub async fn bootstrap(&self, rpc_addr: String) -> anyhow::Result<()> {
    let mut members = BTreeMap::new();
    members.insert(self.node_id, BasicNode { addr: rpc_addr });

    self.raft.initialize(members).await?;

    self.wait_for_leader(BOOTSTRAP_ELECTION_DEADLINE).await?;

    Ok(())
  }

  /// On the leader, adds `server_id` as a learner then promotes it to
  /// voter. A no-op on followers — callers should retry against the
  /// leader address returned in `CoreError::NotLeader`.
  pub async fn join(&self, server_id: NodeId, rpc_addr: String) -> Result<(), CoreError> {
    if self.current_leader().await != Some(self.node_id) {
      return Err(self.not_leader_error().await);
    }

    self
      .raft
      .add_learner(server_id, BasicNode { addr: rpc_addr }, true)
      .await
      .map_err(|err| CoreError::Internal(err.into()))?;

    let mut members: std::collections::BTreeSet<NodeId> = self
      .raft
      .metrics()
      .borrow()
      .membership_config
      .membership()
      .voter_ids()
      .collect();
    members.insert(server_id);

    self
      .raft
      .change_membership(members, false)
      .await
      .map_err(|err| CoreError::Internal(err.into()))?;

    self.audit_join(server_id, rpc_addr).await;

    Ok(())
  }

  /// Appends a `JoinCluster` entry purely for the audit trail — the
  /// membership change itself already committed via `change_membership`
  /// above. Best-effort: a failure here doesn't undo the join.
  async fn audit_join(&self, server_id: NodeId, rpc_addr: String) {
    let command = Command::JoinCluster {
      server_id,
      rpc_addr,
      voter: true,
    };

    if let Err(err) = self.raft.client_write(command).await {
      tracing::warn!(%err, server_id, "failed to record join-cluster audit entry");
    }
  }

  pub async fn leave(&self, server_id: NodeId) -> Result<(), CoreError> {
    if self.current_leader().await != Some(self.node_id) {
      return Err(self.not_leader_error().await);
    }

    let members: std::collections::BTreeSet<NodeId> = self
      .raft
      .metrics()
      .borrow()
      .membership_config
      .membership()
      .voter_ids()
      .filter(|id| *id != server_id)
      .collect();

    self
      .raft
      .change_membership(members, false)
      .await
      .map_err(|err| CoreError::Internal(err.into()))?;

    Ok(())
  }

  pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId, CoreError> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
      if let Some(leader) = self.current_leader().await {
        return Ok(leader);
      }

      if tokio::time::Instant::now() >= deadline {
        return Err(CoreError::Unavailable);
      }

      tokio::time::sleep(Duration::from_millis(50)).await;
    }
  }

  pub async fn current_leader(&self) -> Option<NodeId> {
    self.raft.current_leader().await
  }

  async fn not_leader_error(&self) -> CoreError {
    let metrics = self.raft.metrics().borrow().clone();

    let leader_addr = metrics.current_leader.and_then(|leader_id| {
      metrics
        .membership_config
        .membership()
        .nodes()
        .find(|(id, _)| **id == leader_id)
        .map(|(_, node)| node.addr.clone())
    });

    CoreError::NotLeader { leader_addr }
  }

  /// Submits an `Append` command and waits up to `APPEND_DEADLINE` for it
  /// to commit. Returns the offset the state machine assigned.
  pub async fn append(&self, value: Vec<u8>) -> Result<u64, CoreError> {
    let command = Command::Append { value };

    let result = tokio::time::timeout(APPEND_DEADLINE, self.raft.client_write(command)).await;

    match result {
      Err(_) => Err(CoreError::Unavailable),
      Ok(Err(openraft::error::RaftError::APIError(
        openraft::error::ClientWriteError::ForwardToLeader(forward),
      ))) => Err(CoreError::NotLeader {
        leader_addr: forward.leader_node.as_ref().map(|node| node.addr.clone()),
      }),
      Ok(Err(err)) => Err(CoreError::Internal(err.into())),
      Ok(Ok(response)) => match response.data {
        type_config::CommandResponse::Appended { offset } => Ok(offset),
        type_config::CommandResponse::Acknowledged => Err(CoreError::Internal(anyhow::anyhow!(
          "append command committed but state machine returned no offset"
        ))),
      },
    }
  }

  /// Reads directly from the user log, bypassing consensus — consumers
  /// that need a linearizable read must route to the leader themselves.
  pub fn read(&self, offset: u64) -> Result<Record, CoreError> {
    self
      .user_log
      .read(offset)
      .map_err(|err| match err.downcast::<crate::log::LogError>() {
        Ok(crate::log::LogError::OffsetOutOfRange(offset)) => CoreError::OffsetOutOfRange { offset },
        Err(err) => CoreError::Internal(err),
      })
  }

  /// Signaled every time a record is applied to the user log, whether
  /// appended locally or replicated from the leader. Lets consumers wait
  /// for new data instead of polling.
  pub fn new_record_notify(&self) -> Arc<Notify> {
    self.new_record.clone()
  }

  pub fn lowest_offset(&self) -> u64 {
    self.user_log.lowest_offset()
  }

  pub fn highest_offset(&self) -> u64 {
    self.user_log.highest_offset()
  }

  /// A frozen byte-stream view over the user log, the same one the state
  /// machine's snapshot builder uses — exposed for administrative
  /// snapshot/backup tooling outside the raft protocol itself.
  pub fn snapshot_reader(&self) -> anyhow::Result<crate::log::LogReader> {
    self.user_log.reader()
  }

  pub async fn servers(&self) -> Vec<ServerInfo> {
    let metrics = self.raft.metrics().borrow().clone();
    let leader = metrics.current_leader;

    metrics
      .membership_config
      .membership()
      .nodes()
      .map(|(id, node)| ServerInfo {
        id: *id,
        rpc_addr: node.addr.clone(),
        is_leader: leader == Some(*id),
      })
      .collect()
  }

  /// Transitions to follower, shuts down the raft core, and flushes both
  /// logs to disk.
  pub async fn close(&self) -> anyhow::Result<()> {
    self.raft.shutdown().await?;
    self.user_log.close()?;

    Ok(())
  }
}

/// Serves one inbound consensus connection accepted by the stream layer
/// (sentinel byte already consumed).
pub async fn handle_raft_connection<S: AsyncRead + AsyncWrite + Unpin>(
  stream: S,
  replicated_log: &ReplicatedLog,
) -> std::io::Result<()> {
  serve_connection(stream, replicated_log.raft()).await
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn single_node() -> (Arc<ReplicatedLog>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().to_str().unwrap().to_string();

    let replicated_log = ReplicatedLog::new(1, "127.0.0.1:0".to_string(), &data_dir, Default::default(), None)
      .await
      .unwrap();

    replicated_log.bootstrap("127.0.0.1:0".to_string()).await.unwrap();

    (replicated_log, dir)
  }

  #[tokio::test]
  async fn bootstrap_wins_its_own_election() {
    let (replicated_log, _dir) = single_node().await;

    assert_eq!(Some(1), replicated_log.current_leader().await);
  }

  #[tokio::test]
  async fn append_commits_and_read_returns_it_back() {
    let (replicated_log, _dir) = single_node().await;

    let offset = replicated_log.append(b"hello".to_vec()).await.unwrap();
    assert_eq!(0, offset);

    let record = replicated_log.read(offset).unwrap();
    assert_eq!(b"hello", record.value.as_slice());
  }

  #[tokio::test]
  async fn read_of_an_unknown_offset_is_out_of_range() {
    let (replicated_log, _dir) = single_node().await;

    let err = replicated_log.read(7).unwrap_err();
    assert!(matches!(err, CoreError::OffsetOutOfRange { offset: 7 }));
  }

  #[tokio::test]
  async fn servers_reports_the_bootstrap_node_as_leader() {
    let (replicated_log, _dir) = single_node().await;

    let servers = replicated_log.servers().await;
    assert_eq!(1, servers.len());
    assert_eq!(1, servers[0].id);
    assert!(servers[0].is_leader);
  }

  #[tokio::test]
  async fn new_record_notify_fires_after_append() {
    let (replicated_log, _dir) = single_node().await;
    let notify = replicated_log.new_record_notify();

    let waiter = tokio::spawn(async move { notify.notified().await });

    // The default current-thread test runtime only runs the spawned task on
    // an await point, so these yields deterministically let it register as
    // a waiter before `append` calls `notify_waiters`.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    replicated_log.append(b"ping".to_vec()).await.unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
      .await
      .unwrap()
      .unwrap();
  }
}
