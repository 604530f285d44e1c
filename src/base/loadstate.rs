/// The current state of a socket request.
/// This roughly matches the socket slice of net/base/load_states.h
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    /// The request is idle.
    #[default]
    Idle,

    /// Waiting for a slot in a pool stalled on the global socket limit.
    WaitingForStalledSocketPool,

    /// Waiting for an available socket in its own group.
    WaitingForAvailableSocket,

    /// Establishing proxy tunnel.
    EstablishingProxyTunnel,

    /// Resolving the host.
    ResolvingHost,

    /// Connecting to the host (TCP handshake).
    Connecting,

    /// Establishing an SSL connection.
    SslHandshake,
}
