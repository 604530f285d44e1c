use std::io;
use thiserror::Error;

/// Network error type mirroring the socket-pool slice of Chromium's
/// net/base/net_error_list.h.
///
/// Covers connection establishment, pool admission, and the invalidation
/// errors surfaced when pooled state is flushed after a configuration
/// change. `Pending` is deliberately absent: a request that cannot complete
/// synchronously is not an error (see `RequestResult`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetError {
    // Generic
    #[error("Operation aborted")]
    Aborted,
    #[error("Operation timed out")]
    TimedOut,
    #[error("Unexpected failure")]
    Unexpected,
    #[error("Network changed")]
    NetworkChanged,

    // Connection Errors
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Internet disconnected")]
    InternetDisconnected,
    #[error("Socket not connected")]
    SocketNotConnected,
    #[error("Address invalid")]
    AddressInvalid,
    #[error("Address unreachable")]
    AddressUnreachable,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("Address in use")]
    AddressInUse,

    // Pool admission and interaction
    #[error("Proxy auth requested")]
    ProxyAuthRequested,
    #[error("Preconnect max socket limit")]
    PreconnectMaxSocketLimit,

    // Configuration invalidation
    #[error("Cert database changed")]
    CertDatabaseChanged,
    #[error("Cert verifier changed")]
    CertVerifierChanged,
    #[error("SSL configuration changed")]
    SslConfigChanged,

    // HTTP/URL level
    #[error("Invalid URL")]
    InvalidUrl,

    // Edge case errors (custom codes in the -10000 range, clear of
    // Chromium's reserved ranges)
    #[error("Socket closed by remote")]
    SocketRemoteClosed,
    #[error("Data received unexpectedly on idle socket")]
    DataReceivedUnexpectedly,
    #[error("Socket pool destroyed")]
    SocketPoolDestroyed,

    #[error("Unknown error: {0}")]
    Unknown(i32),
}

impl NetError {
    /// Stable integer code. Chromium's value where one exists, the custom
    /// `-10000` range otherwise.
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::Aborted => -3,
            NetError::TimedOut => -7,
            NetError::Unexpected => -9,
            NetError::NetworkChanged => -21,

            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed => -104,
            NetError::NameNotResolved => -105,
            NetError::InternetDisconnected => -106,
            NetError::AddressInvalid => -108,
            NetError::AddressUnreachable => -109,
            NetError::SocketNotConnected => -112,
            NetError::ConnectionTimedOut => -118,
            NetError::AddressInUse => -147,

            NetError::ProxyAuthRequested => -127,
            NetError::PreconnectMaxSocketLimit => -133,

            NetError::CertDatabaseChanged => -528,
            NetError::SslConfigChanged => -529,
            NetError::CertVerifierChanged => -530,

            NetError::InvalidUrl => -300,

            NetError::SocketRemoteClosed => -10001,
            NetError::DataReceivedUnexpectedly => -10002,
            NetError::SocketPoolDestroyed => -10013,

            NetError::Unknown(code) => *code,
        }
    }
}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        use io::ErrorKind;
        match e.kind() {
            ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            ErrorKind::ConnectionReset => Self::ConnectionReset,
            ErrorKind::ConnectionAborted => Self::ConnectionAborted,
            ErrorKind::NotConnected => Self::SocketNotConnected,
            ErrorKind::AddrInUse => Self::AddressInUse,
            ErrorKind::AddrNotAvailable => Self::AddressUnreachable,
            ErrorKind::TimedOut => Self::ConnectionTimedOut,
            _ => Self::ConnectionFailed,
        }
    }
}

impl From<url::ParseError> for NetError {
    fn from(_: url::ParseError) -> Self {
        Self::InvalidUrl
    }
}
