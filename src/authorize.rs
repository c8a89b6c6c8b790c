/// The core only ever calls `Authorize(subject, object, action)`; deciding
/// what that means — an ACL file, a policy engine, a no-op — is someone
/// else's problem. This module supplies the hook and two trivial
/// implementations: allow everything (the default) and deny everything
/// (for exercising the permission-denied path in tests).
use crate::error::CoreError;

pub trait Authorizer: Send + Sync {
  fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<(), CoreError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
  fn authorize(&self, _subject: &str, _object: &str, _action: &str) -> Result<(), CoreError> {
    Ok(())
  }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

impl Authorizer for DenyAll {
  fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<(), CoreError> {
    Err(CoreError::PermissionDenied {
      subject: subject.to_string(),
      action: action.to_string(),
      object: object.to_string(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn allow_all_never_denies() {
    assert!(AllowAll.authorize("alice", "*", "produce").is_ok());
  }

  #[test]
  fn deny_all_always_denies() {
    assert!(DenyAll.authorize("alice", "*", "produce").is_err());
  }
}
