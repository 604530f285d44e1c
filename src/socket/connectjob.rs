//! Connect jobs: in-flight attempts to produce a connected socket.
//!
//! The pool treats a [`ConnectJob`] as opaque: it starts it, tracks its
//! priority and load state, and collects the socket on completion. Async
//! completion is reported through a [`ConnectJobDelegate`], never from
//! within [`ConnectJob::connect`] itself.
//!
//! [`TransportConnectJob`] is the thin production implementation:
//! resolve → sequential TCP attempts. Proxy greetings and TLS handshakes
//! belong to richer jobs layered by the embedder.

use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::base::priority::RequestPriority;
use crate::socket::group_id::GroupId;
use crate::socket::handle::ConnectErrorDetails;
use crate::socket::pool::TransportClientSocketPool;
use crate::socket::stream::{StreamSocket, TcpClientSocket};
use crate::socket::RequestResult;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;

/// Connection attempt timeout (4 minutes, matches Chromium).
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(240);

/// Pool-unique identity of a connect job. Requests reference their assigned
/// job by id; ids are never reused within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub(crate) u64);

/// A proxy authentication challenge raised mid-handshake.
///
/// Delivered to the proxy-auth callback of the request the job was bound
/// to. Invoking `restart_with_auth` resumes the job with fresh credentials.
pub struct ProxyAuthChallenge {
    /// Raw response headers of the 407 the proxy answered with.
    pub response_headers: String,
    pub restart_with_auth: Box<dyn FnOnce()>,
}

impl std::fmt::Debug for ProxyAuthChallenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyAuthChallenge")
            .field("response_headers", &self.response_headers)
            .finish()
    }
}

/// An in-flight attempt to produce a connected transport socket.
///
/// Contract: `connect` either returns a synchronous outcome or
/// `RequestResult::Pending`; in the pending case the job must later call
/// [`ConnectJobDelegate::on_connect_job_complete`] exactly once, from a
/// spawned task (never synchronously from inside `connect` or any pool
/// callback).
pub trait ConnectJob {
    fn connect(&mut self) -> RequestResult;

    fn priority(&self) -> RequestPriority;

    /// Called when the job is reassigned to a request with a different
    /// priority.
    fn change_priority(&mut self, priority: RequestPriority);

    fn load_state(&self) -> LoadState;

    /// True once the transport connection exists, even if later stages
    /// (proxy greeting, TLS) are still running. Gates the backup job.
    fn has_established_connection(&self) -> bool;

    /// Yield the connected socket. At most one socket per job.
    fn pass_socket(&mut self) -> Option<Box<dyn StreamSocket>>;

    /// Extra error state for the caller after a failure.
    fn connect_error_details(&self) -> Option<ConnectErrorDetails> {
        None
    }
}

/// The job's channel back into the pool. Handed to the factory at job
/// creation; jobs clone it into their completion tasks.
#[derive(Clone)]
pub struct ConnectJobDelegate {
    pool: Weak<TransportClientSocketPool>,
    group_id: GroupId,
    job_id: JobId,
}

impl ConnectJobDelegate {
    pub(crate) fn new(
        pool: Weak<TransportClientSocketPool>,
        group_id: GroupId,
        job_id: JobId,
    ) -> Self {
        Self { pool, group_id, job_id }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Report the final outcome of a job that returned `Pending`.
    pub fn on_connect_job_complete(&self, result: Result<(), NetError>) {
        if let Some(pool) = self.pool.upgrade() {
            pool.on_connect_job_complete(&self.group_id, self.job_id, result);
        }
    }

    /// Report a proxy authentication challenge. The pool binds the job to
    /// the highest-priority waiting request that can handle the challenge,
    /// or fails the job with `ProxyAuthRequested` if none can.
    pub fn on_needs_proxy_auth(&self, challenge: ProxyAuthChallenge) {
        if let Some(pool) = self.pool.upgrade() {
            pool.on_needs_proxy_auth(&self.group_id, self.job_id, challenge);
        }
    }
}

/// Creates connect jobs for the pool. Swapped out for a mock in tests.
pub trait ConnectJobFactory {
    fn new_connect_job(
        &self,
        group_id: &GroupId,
        priority: RequestPriority,
        delegate: ConnectJobDelegate,
    ) -> Box<dyn ConnectJob>;
}

struct TransportConnectState {
    load_state: LoadState,
    socket: Option<TcpClientSocket>,
    established: bool,
    error_details: Option<ConnectErrorDetails>,
}

/// DNS resolution followed by sequential TCP connection attempts.
pub struct TransportConnectJob {
    host: String,
    port: u16,
    priority: RequestPriority,
    state: Rc<RefCell<TransportConnectState>>,
    delegate: ConnectJobDelegate,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl TransportConnectJob {
    pub fn new(group_id: &GroupId, priority: RequestPriority, delegate: ConnectJobDelegate) -> Self {
        Self {
            host: group_id.host().to_string(),
            port: group_id.port(),
            priority,
            state: Rc::new(RefCell::new(TransportConnectState {
                load_state: LoadState::Idle,
                socket: None,
                established: false,
                error_details: None,
            })),
            delegate,
            task: None,
        }
    }

    async fn run(host: String, port: u16, state: Rc<RefCell<TransportConnectState>>) -> Result<(), NetError> {
        state.borrow_mut().load_state = LoadState::ResolvingHost;
        tracing::debug!(host = %host, port, "transport connect: resolving");

        let addrs: Vec<std::net::SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| {
                state.borrow_mut().error_details = Some(ConnectErrorDetails {
                    failed_at: LoadState::ResolvingHost,
                    os_error: e.raw_os_error(),
                });
                NetError::NameNotResolved
            })?
            .collect();
        if addrs.is_empty() {
            state.borrow_mut().error_details =
                Some(ConnectErrorDetails { failed_at: LoadState::ResolvingHost, os_error: None });
            return Err(NetError::NameNotResolved);
        }

        state.borrow_mut().load_state = LoadState::Connecting;
        let mut last_error = NetError::ConnectionFailed;
        let mut last_os_error = None;
        for addr in &addrs {
            match tokio::time::timeout(CONNECTION_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let mut guard = state.borrow_mut();
                    guard.socket = Some(TcpClientSocket::new(stream));
                    guard.established = true;
                    guard.load_state = LoadState::Idle;
                    tracing::debug!(host = %host, port, %addr, "transport connect: established");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    last_os_error = e.raw_os_error();
                    last_error = NetError::from(e);
                }
                Err(_) => {
                    last_os_error = None;
                    last_error = NetError::ConnectionTimedOut;
                }
            }
        }

        state.borrow_mut().error_details =
            Some(ConnectErrorDetails { failed_at: LoadState::Connecting, os_error: last_os_error });
        tracing::debug!(host = %host, port, error = %last_error, "transport connect: failed");
        Err(last_error)
    }
}

impl ConnectJob for TransportConnectJob {
    fn connect(&mut self) -> RequestResult {
        let host = self.host.clone();
        let port = self.port;
        let state = Rc::clone(&self.state);
        let delegate = self.delegate.clone();
        self.task = Some(tokio::task::spawn_local(async move {
            let result = Self::run(host, port, state).await;
            delegate.on_connect_job_complete(result);
        }));
        RequestResult::Pending
    }

    fn priority(&self) -> RequestPriority {
        self.priority
    }

    fn change_priority(&mut self, priority: RequestPriority) {
        // TCP gives us no knob to turn; remember the value so the pool's
        // priority bookkeeping stays coherent.
        self.priority = priority;
    }

    fn load_state(&self) -> LoadState {
        self.state.borrow().load_state
    }

    fn has_established_connection(&self) -> bool {
        self.state.borrow().established
    }

    fn pass_socket(&mut self) -> Option<Box<dyn StreamSocket>> {
        self.state
            .borrow_mut()
            .socket
            .take()
            .map(|socket| Box::new(socket) as Box<dyn StreamSocket>)
    }

    fn connect_error_details(&self) -> Option<ConnectErrorDetails> {
        self.state.borrow().error_details.clone()
    }
}

impl Drop for TransportConnectJob {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Factory for [`TransportConnectJob`]s.
#[derive(Default)]
pub struct TransportConnectJobFactory;

impl ConnectJobFactory for TransportConnectJobFactory {
    fn new_connect_job(
        &self,
        group_id: &GroupId,
        priority: RequestPriority,
        delegate: ConnectJobDelegate,
    ) -> Box<dyn ConnectJob> {
        Box::new(TransportConnectJob::new(group_id, priority, delegate))
    }
}
