//! Error information and classification
//!
//! [`ErrorInfo`] is the single error value that crosses the engine boundary:
//! it travels inside protocol messages, completes pending sends and annotates
//! state changes. [`ErrorKind`] is derived from the numeric code and HTTP-style
//! status so every layer classifies the same error the same way.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known error codes
pub mod codes {
    /// Bad request, used when no more specific code applies to a rejection
    pub const BAD_REQUEST: u32 = 40000;
    /// Message exceeded the negotiated maximum size
    pub const MESSAGE_TOO_LARGE: u32 = 40009;
    /// Submission rejected before it reached the wire
    pub const MESSAGE_REJECTED: u32 = 40010;
    /// Credentials missing or invalid
    pub const UNAUTHORIZED: u32 = 40100;
    /// Credentials valid but lacking permission
    pub const FORBIDDEN: u32 = 40300;
    /// Generic internal server error
    pub const INTERNAL: u32 = 50000;
    /// Connection attempt or request timed out
    pub const TIMEOUT: u32 = 50003;
    /// Connection is in the failed state
    pub const CONNECTION_FAILED: u32 = 80000;
    /// Connection is suspended
    pub const CONNECTION_SUSPENDED: u32 = 80002;
    /// Connection is disconnected or the host was unreachable
    pub const DISCONNECTED: u32 = 80003;
    /// Recovery or resume of a previous session was refused
    pub const RECOVERY_EXPIRED: u32 = 80008;
    /// Malformed or out-of-protocol message
    pub const PROTOCOL_ERROR: u32 = 80013;
    /// Connection has been closed
    pub const CONNECTION_CLOSED: u32 = 80017;
    /// Transport kind not supported in this environment
    pub const TRANSPORT_UNAVAILABLE: u32 = 80019;
}

/// Classification of an [`ErrorInfo`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport kind cannot be used here; skip it silently
    TransportUnavailable,
    /// Host or network unreachable, DNS failure, dropped link
    NetworkUnreachable,
    /// Connect or request deadline elapsed
    Timeout,
    /// 5xx-class response from the server
    ServerUnavailable,
    /// Credentials rejected
    AuthenticationFailed,
    /// Credentials lack permission
    AuthorizationFailed,
    /// Malformed or fatal protocol exchange
    ProtocolViolation,
    /// Session could not be resumed or recovered
    RecoveryExpired,
    /// A single message was refused
    MessageRejected,
    /// Connection is suspended
    Suspended,
    /// Connection has been closed
    Closed,
    /// Connection has failed
    Failed,
    /// Anything not covered above
    Unknown,
}

impl ErrorKind {
    /// Whether another host or a later attempt may succeed
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkUnreachable
                | ErrorKind::Timeout
                | ErrorKind::ServerUnavailable
                | ErrorKind::Suspended
        )
    }

    /// Whether the connection must move to `failed` without retrying
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::AuthenticationFailed
                | ErrorKind::AuthorizationFailed
                | ErrorKind::ProtocolViolation
                | ErrorKind::Failed
        )
    }
}

/// Error value carried by protocol messages, completions and state changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Numeric error code, see [`codes`]
    pub code: u32,
    /// HTTP-style status, when the server supplied one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Human readable description
    pub message: String,
}

impl ErrorInfo {
    /// Create an error with an explicit code and status
    pub fn new(code: u32, status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
        }
    }

    /// Host unreachable or link dropped
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(codes::DISCONNECTED, Some(503), message)
    }

    /// Connection suspended after the state TTL elapsed
    pub fn suspended(message: impl Into<String>) -> Self {
        Self::new(codes::CONNECTION_SUSPENDED, Some(503), message)
    }

    /// Connection closed by the application
    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(codes::CONNECTION_CLOSED, Some(400), message)
    }

    /// Connection failed
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(codes::CONNECTION_FAILED, Some(400), message)
    }

    /// Deadline elapsed
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(codes::TIMEOUT, Some(504), message)
    }

    /// 5xx-class server response
    pub fn server_unavailable(status_code: u16, message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL, Some(status_code), message)
    }

    /// Credentials rejected
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(codes::UNAUTHORIZED, Some(401), message)
    }

    /// Credentials lack permission
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(codes::FORBIDDEN, Some(403), message)
    }

    /// Malformed or out-of-protocol exchange
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(codes::PROTOCOL_ERROR, Some(400), message)
    }

    /// Session could not be recovered or resumed
    pub fn recovery_expired(message: impl Into<String>) -> Self {
        Self::new(codes::RECOVERY_EXPIRED, Some(400), message)
    }

    /// Transport kind unsupported in this environment
    pub fn transport_unavailable(message: impl Into<String>) -> Self {
        Self::new(codes::TRANSPORT_UNAVAILABLE, None, message)
    }

    /// Single message refused
    pub fn message_rejected(message: impl Into<String>) -> Self {
        Self::new(codes::MESSAGE_REJECTED, Some(400), message)
    }

    /// Message larger than the negotiated limit
    pub fn message_too_large(size: usize, limit: usize) -> Self {
        Self::new(
            codes::MESSAGE_TOO_LARGE,
            Some(400),
            format!("message of {size} bytes exceeds maximum of {limit} bytes"),
        )
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self.code {
            codes::TRANSPORT_UNAVAILABLE => return ErrorKind::TransportUnavailable,
            codes::RECOVERY_EXPIRED => return ErrorKind::RecoveryExpired,
            codes::PROTOCOL_ERROR => return ErrorKind::ProtocolViolation,
            codes::TIMEOUT => return ErrorKind::Timeout,
            codes::DISCONNECTED => return ErrorKind::NetworkUnreachable,
            codes::CONNECTION_SUSPENDED => return ErrorKind::Suspended,
            codes::CONNECTION_CLOSED => return ErrorKind::Closed,
            codes::CONNECTION_FAILED => return ErrorKind::Failed,
            codes::MESSAGE_REJECTED | codes::MESSAGE_TOO_LARGE => {
                return ErrorKind::MessageRejected
            }
            _ => {}
        }

        match (self.status_code, self.code) {
            (Some(401), _) | (_, 40100..=40199) => ErrorKind::AuthenticationFailed,
            (Some(403), _) | (_, 40300..=40399) => ErrorKind::AuthorizationFailed,
            (Some(status), _) if status >= 500 => ErrorKind::ServerUnavailable,
            (_, 50000..=59999) => ErrorKind::ServerUnavailable,
            (_, 40000..=49999) => ErrorKind::MessageRejected,
            _ => ErrorKind::Unknown,
        }
    }

    /// Whether another host or a later attempt may succeed
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Whether the connection must fail without retrying
    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }

    /// Whether this is a 5xx-class server fault rather than a network condition
    pub fn is_server_error(&self) -> bool {
        self.kind() == ErrorKind::ServerUnavailable
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "{} (code {}, status {status})", self.message, self.code),
            None => write!(f, "{} (code {})", self.message, self.code),
        }
    }
}

impl std::error::Error for ErrorInfo {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_errors_are_retryable() {
        assert!(ErrorInfo::disconnected("gone").is_retryable());
        assert!(ErrorInfo::timeout("slow").is_retryable());
        assert!(ErrorInfo::server_unavailable(502, "bad gateway").is_retryable());
        assert!(ErrorInfo::new(12345, Some(503), "overloaded").is_retryable());
    }

    #[test]
    fn test_auth_and_protocol_errors_are_fatal() {
        assert_eq!(
            ErrorInfo::unauthorized("no token").kind(),
            ErrorKind::AuthenticationFailed
        );
        assert_eq!(
            ErrorInfo::new(40160, None, "capability").kind(),
            ErrorKind::AuthenticationFailed
        );
        assert_eq!(
            ErrorInfo::forbidden("denied").kind(),
            ErrorKind::AuthorizationFailed
        );
        assert!(ErrorInfo::protocol("garbled").is_fatal());
        assert!(!ErrorInfo::protocol("garbled").is_retryable());
    }

    #[test]
    fn test_specific_codes_win_over_status() {
        // 80003 carries a 503 status but is a network condition, not a server fault
        let err = ErrorInfo::disconnected("dropped");
        assert_eq!(err.kind(), ErrorKind::NetworkUnreachable);
        assert!(!err.is_server_error());

        let expired = ErrorInfo::recovery_expired("stale");
        assert_eq!(expired.kind(), ErrorKind::RecoveryExpired);
        assert!(!expired.is_fatal());
        assert!(!expired.is_retryable());
    }

    #[test]
    fn test_rejections_and_unknown() {
        assert_eq!(
            ErrorInfo::message_too_large(10, 5).kind(),
            ErrorKind::MessageRejected
        );
        assert_eq!(
            ErrorInfo::new(40020, None, "bad field").kind(),
            ErrorKind::MessageRejected
        );
        assert_eq!(ErrorInfo::new(7, None, "odd").kind(), ErrorKind::Unknown);
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(ErrorInfo::unauthorized("no token")).unwrap();
        assert_eq!(json["code"], 40100);
        assert_eq!(json["statusCode"], 401);

        let parsed: ErrorInfo =
            serde_json::from_str(r#"{"code":80008,"message":"expired"}"#).unwrap();
        assert_eq!(parsed.status_code, None);
        assert_eq!(parsed.kind(), ErrorKind::RecoveryExpired);
    }

    #[test]
    fn test_display_includes_code() {
        let text = ErrorInfo::timeout("connect").to_string();
        assert!(text.contains("50003"));
        assert!(text.contains("connect"));
    }
}
