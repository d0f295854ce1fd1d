//! Shared-token authentication for logins and visitor connections.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authorization failed")]
    Failed,

    #[error("authorization timeout")]
    Expired,
}

/// Compute the key a client must present for `timestamp`:
/// the MD5 hex digest of the token concatenated with the decimal timestamp.
pub fn privilege_key(token: &str, timestamp: i64) -> String {
    format!("{:x}", md5::compute(format!("{}{}", token, timestamp)))
}

/// Verify a presented key against the shared token.
///
/// `auth_timeout_secs` bounds clock skew between client and server;
/// zero disables the window check entirely.
pub fn verify_privilege_key(
    token: &str,
    timestamp: i64,
    key: &str,
    auth_timeout_secs: i64,
    now: i64,
) -> Result<(), AuthError> {
    if auth_timeout_secs != 0 && (now - timestamp).abs() > auth_timeout_secs {
        return Err(AuthError::Expired);
    }
    if privilege_key(token, timestamp) != key {
        return Err(AuthError::Failed);
    }
    Ok(())
}
