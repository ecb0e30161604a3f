//! Error types for the SFTP gateway.
//!
//! Every internal failure mode maps onto one of the SFTP v3 status codes via
//! [`Error::to_status_code`], and [`Error::sanitized_message`] produces the
//! text actually sent to the peer. Sandbox geometry, credential detail, and
//! configuration paths never appear in peer-visible messages.

use thiserror::Error;

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from an underlying filesystem or socket call.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH transport or key handling error.
    #[error("SSH error: {0}")]
    Ssh(String),

    /// Malformed or out-of-sequence SFTP packet.
    #[error("SFTP protocol error: {0}")]
    Protocol(String),

    /// A requested path resolved outside the tenant root.
    ///
    /// Reported to the peer as `NoSuchFile` so the sandbox layout is not
    /// disclosed.
    #[error("path escapes the tenant root: {0}")]
    PathEscape(String),

    /// A rename/symlink target resolved outside the tenant root.
    ///
    /// Reported as `OpUnsupported`.
    #[error("target path escapes the tenant root: {0}")]
    TargetEscape(String),

    /// The session principal lacks the capability tag for this operation.
    #[error("missing capability: {0}")]
    CapabilityDenied(&'static str),

    /// The gateway is running with the read-only switch set.
    #[error("server is running in read-only mode")]
    ReadOnly,

    /// The tenant's cached disk usage exceeds its configured limit.
    #[error("disk quota exhausted for tenant {0}")]
    QuotaExceeded(String),

    /// File or directory does not exist.
    #[error("no such file: {0}")]
    FileNotFound(String),

    /// Invalid or closed file handle.
    #[error("invalid file handle: {0}")]
    InvalidHandle(String),

    /// Unsupported SFTP operation or request method.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Per-session resource limit reached (open handles).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The credential oracle rejected the username/password pair.
    #[error("the credentials provided were invalid")]
    InvalidCredentials,

    /// The credential oracle refused to serve the request.
    #[error("credential oracle refused the request: {0}")]
    OracleUnavailable(String),

    /// Any other authentication failure (transport errors, unexpected
    /// statuses). Collapsed to a single refusal at the SSH layer.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network connection failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// SSH channel unexpectedly closed.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

impl Error {
    /// SFTP status code for this error, per the peer-visible mapping:
    /// escapes read as missing files, target escapes and read-only writes as
    /// unsupported operations, quota denials as plain failures.
    pub fn to_status_code(&self) -> u32 {
        use crate::protocol::StatusCode;

        match self {
            Error::PathEscape(_) | Error::FileNotFound(_) => StatusCode::NoSuchFile as u32,
            Error::TargetEscape(_) | Error::ReadOnly | Error::NotSupported(_) => {
                StatusCode::OpUnsupported as u32
            }
            Error::CapabilityDenied(_) => StatusCode::PermissionDenied as u32,
            Error::Protocol(_) | Error::InvalidHandle(_) => StatusCode::BadMessage as u32,
            Error::Connection(_) | Error::ChannelClosed(_) => StatusCode::ConnectionLost as u32,
            _ => StatusCode::Failure as u32,
        }
    }

    /// Message safe to send to the peer. Paths, tenant ids, and oracle
    /// responses are stripped.
    pub fn sanitized_message(&self) -> String {
        match self {
            Error::PathEscape(_) | Error::FileNotFound(_) => "no such file".to_string(),
            Error::CapabilityDenied(_) => "permission denied".to_string(),
            Error::TargetEscape(_) | Error::ReadOnly | Error::NotSupported(_) => {
                "operation not supported".to_string()
            }
            Error::QuotaExceeded(_) => "insufficient disk space".to_string(),
            Error::InvalidCredentials | Error::OracleUnavailable(_) | Error::Authentication(_) => {
                "credentials could not be validated".to_string()
            }
            Error::Config(_) => "server configuration error".to_string(),
            Error::Io(_) => "failure".to_string(),
            _ => self.to_string(),
        }
    }

    /// True for errors that should be surfaced in the security log stream.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            Error::PathEscape(_)
                | Error::TargetEscape(_)
                | Error::CapabilityDenied(_)
                | Error::InvalidCredentials
                | Error::Authentication(_)
        )
    }

    pub fn protocol(context: impl Into<String>) -> Self {
        Error::Protocol(context.into())
    }

    pub fn invalid_handle(context: impl Into<String>) -> Self {
        Error::InvalidHandle(context.into())
    }

    pub fn not_supported(context: impl Into<String>) -> Self {
        Error::NotSupported(context.into())
    }

    pub fn channel_closed(context: impl Into<String>) -> Self {
        Error::ChannelClosed(context.into())
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Ssh(err.to_string())
    }
}

impl From<russh_keys::Error> for Error {
    fn from(err: russh_keys::Error) -> Self {
        Error::Ssh(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StatusCode;

    #[test]
    fn test_escape_reads_as_missing_file() {
        assert_eq!(
            Error::PathEscape("/../other".into()).to_status_code(),
            StatusCode::NoSuchFile as u32
        );
        assert_eq!(
            Error::PathEscape("/../other".into()).sanitized_message(),
            "no such file"
        );
    }

    #[test]
    fn test_target_escape_reads_as_unsupported() {
        assert_eq!(
            Error::TargetEscape("/../other".into()).to_status_code(),
            StatusCode::OpUnsupported as u32
        );
    }

    #[test]
    fn test_read_only_and_unknown_methods_unsupported() {
        assert_eq!(
            Error::ReadOnly.to_status_code(),
            StatusCode::OpUnsupported as u32
        );
        assert_eq!(
            Error::not_supported("Readlink").to_status_code(),
            StatusCode::OpUnsupported as u32
        );
    }

    #[test]
    fn test_capability_denial() {
        let err = Error::CapabilityDenied("move-files");
        assert_eq!(err.to_status_code(), StatusCode::PermissionDenied as u32);
        assert_eq!(err.sanitized_message(), "permission denied");
        assert!(err.is_security_event());
    }

    #[test]
    fn test_quota_denial_is_plain_failure() {
        let err = Error::QuotaExceeded("tenant-a".into());
        assert_eq!(err.to_status_code(), StatusCode::Failure as u32);
        assert!(!err.sanitized_message().contains("tenant-a"));
    }

    #[test]
    fn test_auth_errors_collapse() {
        for err in [
            Error::InvalidCredentials,
            Error::OracleUnavailable("server in bad state".into()),
            Error::Authentication("status 500".into()),
        ] {
            assert_eq!(err.sanitized_message(), "credentials could not be validated");
        }
    }
}
