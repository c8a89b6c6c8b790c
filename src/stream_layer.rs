/// Shares one TCP listener between consensus RPC traffic and user-facing
/// tonic RPC traffic. The first byte of every accepted connection decides
/// the destination: the consensus sentinel (`0x01`) routes to the raft
/// core, anything else is handed to the tonic server as an ordinary
/// incoming connection (optionally wrapped in server TLS first).
use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use rustls::Certificate;
use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf},
  net::{TcpListener, TcpStream},
  sync::mpsc,
};
use tokio_rustls::{server::TlsStream, TlsAcceptor};

use crate::replicated_log::{self, ReplicatedLog, RAFT_RPC_SENTINEL};

pub struct StreamLayer {
  listener: TcpListener,
  server_tls: Option<Arc<rustls::ServerConfig>>,
}

impl StreamLayer {
  pub async fn bind(addr: SocketAddr, server_tls: Option<Arc<rustls::ServerConfig>>) -> Result<Self> {
    let listener = TcpListener::bind(addr).await?;

    Ok(Self { listener, server_tls })
  }

  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// Accepts connections forever, dispatching consensus traffic directly to
  /// `replicated_log` and forwarding everything else down `rpc_tx` for the
  /// tonic server to consume via `Router::serve_with_incoming`.
  pub async fn run(
    self,
    replicated_log: Arc<ReplicatedLog>,
    rpc_tx: mpsc::Sender<std::io::Result<MuxedStream>>,
  ) -> Result<()> {
    loop {
      let (socket, _) = self.listener.accept().await?;

      let server_tls = self.server_tls.clone();
      let replicated_log = replicated_log.clone();
      let rpc_tx = rpc_tx.clone();

      tokio::spawn(async move {
        if let Err(err) = dispatch(socket, server_tls, replicated_log, rpc_tx).await {
          tracing::warn!(%err, "dropping connection accepted by the stream layer");
        }
      });
    }
  }
}

async fn dispatch(
  mut socket: TcpStream,
  server_tls: Option<Arc<rustls::ServerConfig>>,
  replicated_log: Arc<ReplicatedLog>,
  rpc_tx: mpsc::Sender<std::io::Result<MuxedStream>>,
) -> Result<()> {
  let mut sentinel = [0u8; 1];

  if socket.peek(&mut sentinel).await? == 0 {
    return Ok(());
  }

  if sentinel[0] == RAFT_RPC_SENTINEL {
    socket.read_exact(&mut sentinel).await?;
    replicated_log::handle_raft_connection(socket, &replicated_log).await?;
    return Ok(());
  }

  let stream = match server_tls {
    Some(config) => MuxedStream::Tls(Box::new(TlsAcceptor::from(config).accept(socket).await?)),
    None => MuxedStream::Tcp(socket),
  };

  rpc_tx.send(Ok(stream)).await.ok();

  Ok(())
}

/// Either side of the demultiplexer's non-consensus branch, handed to
/// tonic's incoming-connection stream.
pub enum MuxedStream {
  Tcp(TcpStream),
  Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MuxedStream {
  fn poll_read(
    self: std::pin::Pin<&mut Self>,
    cx: &mut std::task::Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> std::task::Poll<std::io::Result<()>> {
    match self.get_mut() {
      MuxedStream::Tcp(s) => std::pin::Pin::new(s).poll_read(cx, buf),
      MuxedStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MuxedStream {
  fn poll_write(
    self: std::pin::Pin<&mut Self>,
    cx: &mut std::task::Context<'_>,
    buf: &[u8],
  ) -> std::task::Poll<std::io::Result<usize>> {
    match self.get_mut() {
      MuxedStream::Tcp(s) => std::pin::Pin::new(s).poll_write(cx, buf),
      MuxedStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(
    self: std::pin::Pin<&mut Self>,
    cx: &mut std::task::Context<'_>,
  ) -> std::task::Poll<std::io::Result<()>> {
    match self.get_mut() {
      MuxedStream::Tcp(s) => std::pin::Pin::new(s).poll_flush(cx),
      MuxedStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(
    self: std::pin::Pin<&mut Self>,
    cx: &mut std::task::Context<'_>,
  ) -> std::task::Poll<std::io::Result<()>> {
    match self.get_mut() {
      MuxedStream::Tcp(s) => std::pin::Pin::new(s).poll_shutdown(cx),
      MuxedStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
    }
  }
}

/// The RPC subject, populated from the peer's TLS certificate common name.
/// Empty (`None`) when the connection carries no client certificate.
#[derive(Clone, Debug, Default)]
pub struct PeerIdentity(pub Option<String>);

impl tonic::transport::server::Connected for MuxedStream {
  type ConnectInfo = PeerIdentity;

  fn connect_info(&self) -> Self::ConnectInfo {
    match self {
      MuxedStream::Tcp(_) => PeerIdentity(None),
      MuxedStream::Tls(stream) => {
        let certs: Option<Vec<Certificate>> = stream
          .get_ref()
          .1
          .peer_certificates()
          .map(|certs| certs.to_vec());

        PeerIdentity(crate::tls::peer_common_name(certs.as_deref()))
      }
    }
  }
}
