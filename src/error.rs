/// Wire-facing error family. Every RPC method maps its result into one of
/// these variants before it crosses the `tonic::Status` boundary; internal
/// `anyhow::Error`s from the storage layer collapse into `Internal`.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
  #[error("offset {offset} is out of range")]
  OffsetOutOfRange { offset: u64 },

  #[error("not leader; leader is at {leader_addr:?}")]
  NotLeader { leader_addr: Option<String> },

  #[error("subject {subject:?} is not permitted to {action} {object:?}")]
  PermissionDenied {
    subject: String,
    action: String,
    object: String,
  },

  #[error("unavailable")]
  Unavailable,

  #[error("internal error: {0}")]
  Internal(#[from] anyhow::Error),
}

impl From<CoreError> for tonic::Status {
  fn from(err: CoreError) -> Self {
    match err {
      CoreError::OffsetOutOfRange { offset } => {
        tonic::Status::out_of_range(format!("offset {offset} is out of range"))
      }
      CoreError::NotLeader { leader_addr } => tonic::Status::failed_precondition(format!(
        "not leader; leader is at {}",
        leader_addr.unwrap_or_else(|| "unknown".to_string())
      )),
      CoreError::PermissionDenied {
        subject,
        action,
        object,
      } => tonic::Status::permission_denied(format!(
        "{subject} is not permitted to {action} {object}"
      )),
      CoreError::Unavailable => tonic::Status::unavailable("node is not ready"),
      CoreError::Internal(err) => {
        tracing::error!(%err, "internal error crossing the RPC boundary");
        tonic::Status::internal("internal error")
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tonic::Code;

  #[test]
  fn offset_out_of_range_maps_to_out_of_range() {
    let status: tonic::Status = CoreError::OffsetOutOfRange { offset: 9 }.into();
    assert_eq!(Code::OutOfRange, status.code());
  }

  #[test]
  fn not_leader_maps_to_failed_precondition() {
    let status: tonic::Status = CoreError::NotLeader {
      leader_addr: Some("10.0.0.1:8400".to_string()),
    }
    .into();
    assert_eq!(Code::FailedPrecondition, status.code());
  }

  #[test]
  fn permission_denied_maps_to_permission_denied() {
    let status: tonic::Status = CoreError::PermissionDenied {
      subject: "alice".to_string(),
      action: "produce".to_string(),
      object: "*".to_string(),
    }
    .into();
    assert_eq!(Code::PermissionDenied, status.code());
  }

  #[test]
  fn unavailable_maps_to_unavailable() {
    let status: tonic::Status = CoreError::Unavailable.into();
    assert_eq!(Code::Unavailable, status.code());
  }

  #[test]
  fn internal_maps_to_internal_and_hides_detail() {
    let status: tonic::Status = CoreError::Internal(anyhow::anyhow!("disk on fire")).into();
    assert_eq!(Code::Internal, status.code());
    assert!(!status.message().contains("disk on fire"));
  }
}
