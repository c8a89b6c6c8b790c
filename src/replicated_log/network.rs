/// Consensus wire transport. Every connection — inbound or outbound — is
/// distinguished from ordinary RPC traffic by a single sentinel byte
/// (`0x01`) written before anything else; after that, frames are
/// `[len: u32 big-endian][bincode payload]`.
use std::sync::Arc;

use openraft::{
  error::{InstallSnapshotError, NetworkError, RPCError, RaftError, Unreachable},
  network::{RaftNetwork, RaftNetworkFactory, RPCOption},
  raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
  },
  BasicNode,
};
use serde::{Deserialize, Serialize};
use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
  net::TcpStream,
};
use tokio_rustls::TlsConnector;

use super::type_config::{NodeId, TypeConfig};

pub const RAFT_RPC_SENTINEL: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftRpcRequest {
  AppendEntries(AppendEntriesRequest<TypeConfig>),
  InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
  Vote(VoteRequest<TypeConfig>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftRpcResponse {
  AppendEntries(AppendEntriesResponse<TypeConfig>),
  InstallSnapshot(Result<InstallSnapshotResponse<TypeConfig>, String>),
  Vote(VoteResponse<TypeConfig>),
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, payload: &[u8]) -> std::io::Result<()> {
  stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
  stream.write_all(payload).await
}

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Vec<u8>> {
  let mut len_buf = [0u8; 4];
  stream.read_exact(&mut len_buf).await?;
  let len = u32::from_be_bytes(len_buf) as usize;

  let mut buf = vec![0u8; len];
  stream.read_exact(&mut buf).await?;

  Ok(buf)
}

/// Dials `addr`, writes the sentinel byte, wraps in TLS when a peer client
/// config is configured, and returns a boxed stream both sides can frame
/// messages over.
async fn dial(
  addr: &str,
  tls_client_config: &Option<Arc<rustls::ClientConfig>>,
) -> std::io::Result<Box<dyn ReadWrite>> {
  let mut tcp = TcpStream::connect(addr).await?;
  tcp.write_all(&[RAFT_RPC_SENTINEL]).await?;

  match tls_client_config {
    None => Ok(Box::new(tcp)),
    Some(config) => {
      let connector = TlsConnector::from(config.clone());
      let domain = rustls::ServerName::try_from(addr.split(':').next().unwrap_or(addr))
        .map_err(|err| std::io::Error::other(err.to_string()))?;
      let tls = connector.connect(domain, tcp).await?;
      Ok(Box::new(tls))
    }
  }
}

trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ReadWrite for T {}

#[derive(Clone)]
pub struct NetworkFactory {
  tls_client_config: Option<Arc<rustls::ClientConfig>>,
}

impl NetworkFactory {
  pub fn new(tls_client_config: Option<Arc<rustls::ClientConfig>>) -> Self {
    Self { tls_client_config }
  }
}

impl RaftNetworkFactory<TypeConfig> for NetworkFactory {
  type Network = PeerConnection;

  async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
    PeerConnection {
      target,
      addr: node.addr.clone(),
      tls_client_config: self.tls_client_config.clone(),
    }
  }
}

pub struct PeerConnection {
  target: NodeId,
  addr: String,
  tls_client_config: Option<Arc<rustls::ClientConfig>>,
}

impl PeerConnection {
  async fn call(
    &mut self,
    request: RaftRpcRequest,
  ) -> Result<RaftRpcResponse, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
    let unreachable = |err: std::io::Error| RPCError::Unreachable(Unreachable::new(&err));

    let mut stream = dial(&self.addr, &self.tls_client_config)
      .await
      .map_err(unreachable)?;

    let encoded = bincode::serialize(&request)
      .map_err(|err| RPCError::Network(NetworkError::new(&err)))?;

    write_frame(&mut stream, &encoded).await.map_err(unreachable)?;

    let response_bytes = read_frame(&mut stream).await.map_err(unreachable)?;

    bincode::deserialize(&response_bytes)
      .map_err(|err| RPCError::Network(NetworkError::new(&err)))
  }
}

impl RaftNetwork<TypeConfig> for PeerConnection {
  async fn append_entries(
    &mut self,
    rpc: AppendEntriesRequest<TypeConfig>,
    _option: RPCOption,
  ) -> Result<AppendEntriesResponse<TypeConfig>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
    match self.call(RaftRpcRequest::AppendEntries(rpc)).await? {
      RaftRpcResponse::AppendEntries(response) => Ok(response),
      _ => Err(RPCError::Network(NetworkError::new(&std::io::Error::other(
        "unexpected response variant for append_entries",
      )))),
    }
  }

  async fn install_snapshot(
    &mut self,
    rpc: InstallSnapshotRequest<TypeConfig>,
    _option: RPCOption,
  ) -> Result<
    InstallSnapshotResponse<TypeConfig>,
    RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
  > {
    let response = self
      .call(RaftRpcRequest::InstallSnapshot(rpc))
      .await
      .map_err(|err: RPCError<NodeId, BasicNode, RaftError<NodeId>>| match err {
        RPCError::Timeout(t) => RPCError::Timeout(t),
        RPCError::Unreachable(u) => RPCError::Unreachable(u),
        RPCError::PayloadTooLarge(p) => RPCError::PayloadTooLarge(p),
        RPCError::Network(n) => RPCError::Network(n),
        RPCError::RemoteError(_) => RPCError::Network(NetworkError::new(&std::io::Error::other(
          "peer returned a raft-level error for install_snapshot",
        ))),
      })?;

    match response {
      RaftRpcResponse::InstallSnapshot(Ok(response)) => Ok(response),
      RaftRpcResponse::InstallSnapshot(Err(message)) => {
        tracing::error!(%message, "peer rejected install_snapshot");
        Err(RPCError::Network(NetworkError::new(&std::io::Error::other(message))))
      }
      _ => Err(RPCError::Network(NetworkError::new(&std::io::Error::other(
        "unexpected response variant for install_snapshot",
      )))),
    }
  }

  async fn vote(
    &mut self,
    rpc: VoteRequest<TypeConfig>,
    _option: RPCOption,
  ) -> Result<VoteResponse<TypeConfig>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
    match self.call(RaftRpcRequest::Vote(rpc)).await? {
      RaftRpcResponse::Vote(response) => Ok(response),
      _ => Err(RPCError::Network(NetworkError::new(&std::io::Error::other(
        "unexpected response variant for vote",
      )))),
    }
  }
}

/// Serves one inbound consensus connection (sentinel byte already
/// consumed by the stream layer's demultiplexer): reads one framed request,
/// dispatches it to the local raft core, writes back one framed response,
/// then closes. Mirrors the one-shot-per-RPC shape of `PeerConnection::call`.
pub async fn serve_connection<S: AsyncRead + AsyncWrite + Unpin>(
  mut stream: S,
  raft: &openraft::Raft<TypeConfig>,
) -> std::io::Result<()> {
  let request_bytes = read_frame(&mut stream).await?;

  let request: RaftRpcRequest =
    bincode::deserialize(&request_bytes).map_err(|err| std::io::Error::other(err.to_string()))?;

  let response = match request {
    RaftRpcRequest::AppendEntries(rpc) => RaftRpcResponse::AppendEntries(
      raft
        .append_entries(rpc)
        .await
        .map_err(|err| std::io::Error::other(err.to_string()))?,
    ),
    RaftRpcRequest::Vote(rpc) => RaftRpcResponse::Vote(
      raft
        .vote(rpc)
        .await
        .map_err(|err| std::io::Error::other(err.to_string()))?,
    ),
    RaftRpcRequest::InstallSnapshot(rpc) => {
      RaftRpcResponse::InstallSnapshot(raft.install_snapshot(rpc).await.map_err(|err| err.to_string()))
    }
  };

  let encoded = bincode::serialize(&response).map_err(|err| std::io::Error::other(err.to_string()))?;

  write_frame(&mut stream, &encoded).await
}
