/// Raft type configuration: node id, the application-level command enum
/// applied to the user log, and the default tuning knobs.
use openraft::declare_raft_types;
use serde::{Deserialize, Serialize};

pub type NodeId = u64;

/// Command carried by a committed raft entry. `Append`'s `value` becomes a
/// new record in the user log; `JoinCluster` is recorded for audit only —
/// membership itself flows through openraft's native joint-consensus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Command {
  Append { value: Vec<u8> },
  JoinCluster {
    server_id: NodeId,
    rpc_addr: String,
    voter: bool,
  },
}

/// Response to a committed `Command`, returned to the caller that submitted
/// it via `Raft::client_write`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommandResponse {
  Appended { offset: u64 },
  Acknowledged,
}

declare_raft_types!(
  pub TypeConfig:
    D = Command,
    R = CommandResponse,
    NodeId = NodeId,
);

pub fn default_raft_config() -> openraft::Config {
  openraft::Config {
    cluster_name: "proglog".to_string(),
    election_timeout_min: 150,
    election_timeout_max: 300,
    heartbeat_interval: 50,
    ..Default::default()
  }
}
