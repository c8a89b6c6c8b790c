/// Translates cluster-gossip join/leave events into consensus membership
/// commands. The gossip layer itself — discovering peers, deciding they've
/// failed — is an external collaborator; this module only consumes events
/// already delivered on a channel. It's the only component allowed to hold
/// a handle to both the membership source and the replicated log, per the
/// cyclic-ownership-avoidance note: the server never sees the membership
/// source, and the bridge never sees the server.
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{
  error::CoreError,
  replicated_log::{NodeId, ReplicatedLog},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
  Joined { id: NodeId, rpc_addr: String },
  Left { id: NodeId },
}

pub struct MembershipBridge {
  node_id: NodeId,
  replicated_log: Arc<ReplicatedLog>,
}

impl MembershipBridge {
  pub fn new(node_id: NodeId, replicated_log: Arc<ReplicatedLog>) -> Self {
    Self {
      node_id,
      replicated_log,
    }
  }

  /// Consumes membership events until the channel closes (the gossip layer
  /// shut down, which happens as part of node shutdown).
  pub async fn run(self, mut events: mpsc::Receiver<MembershipEvent>) {
    while let Some(event) = events.recv().await {
      self.handle(event).await;
    }
  }

  async fn handle(&self, event: MembershipEvent) {
    match event {
      MembershipEvent::Joined { id, rpc_addr } => {
        if id == self.node_id {
          return;
        }

        match self.replicated_log.join(id, rpc_addr.clone()).await {
          Ok(()) => info!(server_id = id, rpc_addr, "added cluster member"),
          // Followers simply record the member and wait for the leader to
          // converge the configuration.
          Err(CoreError::NotLeader { .. }) => {}
          Err(err) => warn!(%err, server_id = id, "failed to add cluster member"),
        }
      }
      MembershipEvent::Left { id } => {
        if id == self.node_id {
          return;
        }

        match self.replicated_log.leave(id).await {
          Ok(()) => info!(server_id = id, "removed cluster member"),
          Err(CoreError::NotLeader { .. }) => {}
          Err(err) => warn!(%err, server_id = id, "failed to remove cluster member"),
        }
      }
    }
  }
}
