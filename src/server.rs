/// The tonic-facing RPC surface. Every method extracts the caller's
/// identity from the connection (the peer's TLS certificate common name,
/// or the empty string over plain TCP), runs it past the authorizer, then
/// delegates to the replicated log. `ConsumeStream` waits on the log's
/// append notification instead of busy-polling.
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{transport::server::ConnectInfo, Request, Response, Status, Streaming};
use tracing::{error, instrument};

use crate::{
  api,
  authorize::Authorizer,
  error::CoreError,
  replicated_log::ReplicatedLog,
  stream_layer::PeerIdentity,
};

#[derive(Clone)]
pub struct LogServer {
  replicated_log: Arc<ReplicatedLog>,
  authorizer: Arc<dyn Authorizer>,
}

impl LogServer {
  pub fn new(replicated_log: Arc<ReplicatedLog>, authorizer: Arc<dyn Authorizer>) -> Self {
    Self {
      replicated_log,
      authorizer,
    }
  }

  fn subject<T>(request: &Request<T>) -> String {
    request
      .extensions()
      .get::<ConnectInfo<PeerIdentity>>()
      .and_then(|info| info.get_ref().0.clone())
      .unwrap_or_default()
  }

  fn authorize<T>(&self, request: &Request<T>, action: &str) -> Result<(), Status> {
    self
      .authorizer
      .authorize(&Self::subject(request), "*", action)
      .map_err(Status::from)
  }
}

#[tonic::async_trait]
impl api::v1::log_server::Log for LogServer {
  #[instrument(skip_all)]
  async fn produce(
    &self,
    request: Request<api::v1::ProduceRequest>,
  ) -> Result<Response<api::v1::ProduceResponse>, Status> {
    self.authorize(&request, "produce")?;

    let value = request
      .into_inner()
      .record
      .map(|record| record.value)
      .unwrap_or_default();

    let offset = self.replicated_log.append(value).await.map_err(Status::from)?;

    Ok(Response::new(api::v1::ProduceResponse { offset }))
  }

  #[instrument(skip_all)]
  async fn consume(
    &self,
    request: Request<api::v1::ConsumeRequest>,
  ) -> Result<Response<api::v1::ConsumeResponse>, Status> {
    self.authorize(&request, "consume")?;

    let offset = request.into_inner().offset;

    let record = self.replicated_log.read(offset).map_err(Status::from)?;

    Ok(Response::new(api::v1::ConsumeResponse {
      record: Some(record),
    }))
  }

  type consume_streamStream = ReceiverStream<Result<api::v1::ConsumeResponse, Status>>;

  #[instrument(skip_all)]
  async fn consume_stream(
    &self,
    request: Request<api::v1::ConsumeRequest>,
  ) -> Result<Response<Self::consume_streamStream>, Status> {
    self.authorize(&request, "consume")?;

    let mut offset = request.into_inner().offset;

    let (tx, rx) = mpsc::channel(4);

    let replicated_log = self.replicated_log.clone();
    let new_record = replicated_log.new_record_notify();

    tokio::spawn(async move {
      loop {
        match replicated_log.read(offset) {
          Ok(record) => {
            offset += 1;

            if tx
              .send(Ok(api::v1::ConsumeResponse {
                record: Some(record),
              }))
              .await
              .is_err()
            {
              return;
            }
          }
          Err(CoreError::OffsetOutOfRange { .. }) => {
            new_record.notified().await;
          }
          Err(err) => {
            error!(%err, "consume_stream aborting");
            tx.send(Err(err.into())).await.ok();
            return;
          }
        }
      }
    });

    Ok(Response::new(ReceiverStream::new(rx)))
  }

  type produce_streamStream = ReceiverStream<Result<api::v1::ProduceResponse, Status>>;

  #[instrument(skip_all)]
  async fn produce_stream(
    &self,
    request: Request<Streaming<api::v1::ProduceRequest>>,
  ) -> Result<Response<Self::produce_streamStream>, Status> {
    self.authorize(&request, "produce")?;

    let mut request_streamer = request.into_inner();

    let (tx, rx) = mpsc::channel(4);

    let replicated_log = self.replicated_log.clone();

    tokio::spawn(async move {
      loop {
        let request = match request_streamer.message().await {
          Ok(Some(request)) => request,
          Ok(None) => return,
          Err(err) => {
            error!(%err, "produce_stream's inbound stream errored");
            tx.send(Err(err)).await.ok();
            return;
          }
        };

        let value = request.record.map(|record| record.value).unwrap_or_default();

        let result = replicated_log
          .append(value)
          .await
          .map(|offset| api::v1::ProduceResponse { offset })
          .map_err(Status::from);

        if tx.send(result).await.is_err() {
          return;
        }
      }
    });

    Ok(Response::new(ReceiverStream::new(rx)))
  }

  #[instrument(skip_all)]
  async fn get_servers(
    &self,
    request: Request<api::v1::GetServersRequest>,
  ) -> Result<Response<api::v1::GetServersResponse>, Status> {
    self.authorize(&request, "get_servers")?;

    let servers = self
      .replicated_log
      .servers()
      .await
      .into_iter()
      .map(|server| api::v1::Server {
        id: server.id.to_string(),
        rpc_addr: server.rpc_addr,
        is_leader: server.is_leader,
      })
      .collect();

    Ok(Response::new(api::v1::GetServersResponse { servers }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{api::v1::log_server::Log as _, authorize::DenyAll};

  async fn server() -> (LogServer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().to_str().unwrap().to_string();

    let replicated_log = ReplicatedLog::new(1, "127.0.0.1:0".to_string(), &data_dir, Default::default(), None)
      .await
      .unwrap();
    replicated_log.bootstrap("127.0.0.1:0".to_string()).await.unwrap();

    (LogServer::new(replicated_log, Arc::new(crate::authorize::AllowAll)), dir)
  }

  #[tokio::test]
  async fn produce_then_consume_round_trips_a_value() {
    let (server, _dir) = server().await;

    let produced = server
      .produce(Request::new(api::v1::ProduceRequest {
        record: Some(api::v1::Record {
          offset: 0,
          term: 0,
          value: b"hello".to_vec(),
          record_type: 0,
        }),
      }))
      .await
      .unwrap()
      .into_inner();

    assert_eq!(0, produced.offset);

    let consumed = server
      .consume(Request::new(api::v1::ConsumeRequest { offset: 0 }))
      .await
      .unwrap()
      .into_inner();

    assert_eq!(b"hello", consumed.record.unwrap().value.as_slice());
  }

  #[tokio::test]
  async fn consume_of_an_unknown_offset_is_out_of_range() {
    let (server, _dir) = server().await;

    let status = server
      .consume(Request::new(api::v1::ConsumeRequest { offset: 3 }))
      .await
      .unwrap_err();

    assert_eq!(tonic::Code::OutOfRange, status.code());
  }

  #[tokio::test]
  async fn deny_all_authorizer_rejects_produce() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().to_str().unwrap().to_string();

    let replicated_log = ReplicatedLog::new(1, "127.0.0.1:0".to_string(), &data_dir, Default::default(), None)
      .await
      .unwrap();
    replicated_log.bootstrap("127.0.0.1:0".to_string()).await.unwrap();

    let server = LogServer::new(replicated_log, Arc::new(DenyAll));

    let status = server
      .produce(Request::new(api::v1::ProduceRequest {
        record: Some(api::v1::Record {
          offset: 0,
          term: 0,
          value: b"hello".to_vec(),
          record_type: 0,
        }),
      }))
      .await
      .unwrap_err();

    assert_eq!(tonic::Code::PermissionDenied, status.code());
  }

  #[tokio::test]
  async fn get_servers_reports_the_bootstrap_node() {
    let (server, _dir) = server().await;

    let response = server
      .get_servers(Request::new(api::v1::GetServersRequest {}))
      .await
      .unwrap()
      .into_inner();

    assert_eq!(1, response.servers.len());
    assert!(response.servers[0].is_leader);
  }
}
