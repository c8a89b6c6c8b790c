mod api;
mod authorize;
mod config;
mod error;
mod index;
mod log;
mod membership;
mod replicated_log;
mod segment;
mod server;
mod stream_layer;
mod store;
mod tls;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Server;
use tracing::{info, warn};

use crate::{
  authorize::{AllowAll, Authorizer},
  config::{Cli, Config},
  membership::MembershipBridge,
  replicated_log::ReplicatedLog,
  server::LogServer as LogService,
  stream_layer::{MuxedStream, StreamLayer},
};

fn node_id(node_name: &str) -> replicated_log::NodeId {
  use std::hash::{Hash, Hasher};

  let mut hasher = std::collections::hash_map::DefaultHasher::new();
  node_name.hash(&mut hasher);
  hasher.finish()
}

fn host_of(bind_addr: &str) -> &str {
  bind_addr.split(':').next().unwrap_or(bind_addr)
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .init();

  let config = Config::load(Cli::parse())?;

  let node_id = node_id(&config.node_name);
  let rpc_addr = format!("{}:{}", host_of(&config.bind_addr), config.rpc_port);

  let peer_tls_config = config
    .peer_tls
    .as_ref()
    .map(tls::load_client_config)
    .transpose()
    .context("loading peer TLS config")?;

  let server_tls_config = config
    .server_tls
    .as_ref()
    .map(tls::load_server_config)
    .transpose()
    .context("loading server TLS config")?;

  let replicated_log = ReplicatedLog::new(
    node_id,
    rpc_addr.clone(),
    &config.data_dir,
    config.segment,
    peer_tls_config,
  )
  .await
  .context("opening replicated log")?;

  if config.bootstrap {
    replicated_log
      .bootstrap(rpc_addr.clone())
      .await
      .context("bootstrapping cluster")?;
    info!(node_id, "bootstrapped single-node cluster");
  } else if !config.start_join_addrs.is_empty() {
    warn!(
      addrs = ?config.start_join_addrs,
      "start-join-addrs configured, but joining an existing cluster requires an external \
       membership/gossip integration (out of scope); this node will wait to be added by the \
       current leader"
    );
  }

  let authorizer: Arc<dyn Authorizer> = Arc::new(AllowAll);

  let (membership_tx, membership_rx) = mpsc::channel(16);
  let bridge = MembershipBridge::new(node_id, replicated_log.clone());
  tokio::spawn(bridge.run(membership_rx));
  // Nothing feeds membership_tx today — see the warning above. Kept open so
  // a future gossip integration has a channel to send into without another
  // wiring change; dropping it would close membership_rx and end the
  // bridge's task early.
  std::mem::forget(membership_tx);

  let stream_layer = StreamLayer::bind(rpc_addr.parse()?, server_tls_config).await?;
  info!(addr = %stream_layer.local_addr()?, "listening");

  let (rpc_tx, rpc_rx) = mpsc::channel::<std::io::Result<MuxedStream>>(16);

  let mux_handle = tokio::spawn(stream_layer.run(replicated_log.clone(), rpc_tx));

  let log_service = api::v1::log_server::LogServer::new(LogService::new(
    replicated_log.clone(),
    authorizer,
  ));

  let serve = Server::builder()
    .add_service(log_service)
    .serve_with_incoming(ReceiverStream::new(rpc_rx));

  tokio::select! {
    result = serve => result.context("tonic server exited")?,
    result = mux_handle => result.context("stream layer task panicked")?.context("stream layer exited")?,
    _ = tokio::signal::ctrl_c() => {
      info!("shutting down");
    }
  }

  replicated_log.close().await?;

  Ok(())
}
