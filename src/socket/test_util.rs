//! Test support: scripted connect jobs and fake sockets.
//!
//! Compiled into the crate (not `#[cfg(test)]`) so integration tests and
//! benches can drive the pool without real networks, the way Chromium ships
//! `socket_test_util` alongside `net/socket/`.

use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::base::priority::RequestPriority;
use crate::socket::connectjob::{
    ConnectJob, ConnectJobDelegate, ConnectJobFactory, ProxyAuthChallenge,
};
use crate::socket::group_id::GroupId;
use crate::socket::handle::ConnectErrorDetails;
use crate::socket::pool::CompletionOnceCallback;
use crate::socket::stream::StreamSocket;
use crate::socket::RequestResult;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

/// Run `future` inside a fresh `LocalSet`, as the pool requires.
pub async fn run_local<F: Future>(future: F) -> F::Output {
    tokio::task::LocalSet::new().run_until(future).await
}

/// A completion callback plus a receiver for its result.
pub fn completion() -> (CompletionOnceCallback, oneshot::Receiver<Result<(), NetError>>) {
    let (tx, rx) = oneshot::channel();
    (
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
        rx,
    )
}

#[derive(Debug)]
struct FakeSocketState {
    connected: bool,
    idle: bool,
    was_used: bool,
}

/// Flips a [`FakeStreamSocket`]'s connectivity from outside, even while the
/// pool owns the socket.
#[derive(Clone)]
pub struct FakeSocketControl {
    state: Rc<RefCell<FakeSocketState>>,
}

impl FakeSocketControl {
    pub fn set_connected(&self, connected: bool) {
        self.state.borrow_mut().connected = connected;
    }

    /// `false` simulates unread data in the receive buffer.
    pub fn set_idle(&self, idle: bool) {
        self.state.borrow_mut().idle = idle;
    }

    pub fn set_was_used(&self, was_used: bool) {
        self.state.borrow_mut().was_used = was_used;
    }
}

/// In-memory socket with scripted connectivity.
pub struct FakeStreamSocket {
    state: Rc<RefCell<FakeSocketState>>,
}

impl FakeStreamSocket {
    pub fn new_connected() -> (Self, FakeSocketControl) {
        let state = Rc::new(RefCell::new(FakeSocketState {
            connected: true,
            idle: true,
            was_used: false,
        }));
        (Self { state: Rc::clone(&state) }, FakeSocketControl { state })
    }
}

impl fmt::Debug for FakeStreamSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeStreamSocket").field("state", &self.state.borrow()).finish()
    }
}

impl AsyncRead for FakeStreamSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for FakeStreamSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.state.borrow_mut().was_used = true;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl StreamSocket for FakeStreamSocket {
    fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    fn is_connected_and_idle(&self) -> bool {
        let state = self.state.borrow();
        state.connected && state.idle
    }

    fn was_ever_used(&self) -> bool {
        self.state.borrow().was_used
    }

    fn disconnect(&mut self) {
        self.state.borrow_mut().connected = false;
    }
}

/// What a scripted connect job should do.
#[derive(Clone)]
pub enum MockJobBehavior {
    /// Connect synchronously with a socket.
    SyncOk,
    /// Fail synchronously.
    SyncError(NetError),
    /// Return pending, then succeed after `delay`.
    PendingThenOk { delay: Duration, pending_state: LoadState },
    /// Return pending, then fail after `delay`.
    PendingThenError { delay: Duration, error: NetError },
    /// Return pending and never complete. `established` reports whether the
    /// transport connection exists (it gates the backup job).
    Stalled { load_state: LoadState, established: bool },
    /// Return pending, then raise a proxy auth challenge after `delay`.
    /// Restarting with auth completes the job successfully.
    NeedsProxyAuth { delay: Duration },
}

impl MockJobBehavior {
    /// Pending connect that succeeds after `delay`, reporting a TCP
    /// handshake in progress meanwhile.
    pub fn pending_ok(delay: Duration) -> Self {
        MockJobBehavior::PendingThenOk { delay, pending_state: LoadState::Connecting }
    }
}

struct MockJobState {
    load_state: LoadState,
    established: bool,
    socket: Option<FakeStreamSocket>,
    error_details: Option<ConnectErrorDetails>,
}

type SocketControlRegistry = Rc<RefCell<Vec<FakeSocketControl>>>;

fn make_socket(state: &Rc<RefCell<MockJobState>>, registry: &SocketControlRegistry) {
    let (socket, control) = FakeStreamSocket::new_connected();
    registry.borrow_mut().push(control);
    let mut state = state.borrow_mut();
    state.socket = Some(socket);
    state.established = true;
    state.load_state = LoadState::Idle;
}

/// A connect job driven by a [`MockJobBehavior`] script.
pub struct MockConnectJob {
    behavior: Option<MockJobBehavior>,
    priority: RequestPriority,
    state: Rc<RefCell<MockJobState>>,
    delegate: ConnectJobDelegate,
    registry: SocketControlRegistry,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl MockConnectJob {
    fn new(
        behavior: MockJobBehavior,
        priority: RequestPriority,
        delegate: ConnectJobDelegate,
        registry: SocketControlRegistry,
    ) -> Self {
        Self {
            behavior: Some(behavior),
            priority,
            state: Rc::new(RefCell::new(MockJobState {
                load_state: LoadState::Idle,
                established: false,
                socket: None,
                error_details: None,
            })),
            delegate,
            registry,
            task: None,
        }
    }
}

impl ConnectJob for MockConnectJob {
    fn connect(&mut self) -> RequestResult {
        match self.behavior.take().expect("connect called twice") {
            MockJobBehavior::SyncOk => {
                make_socket(&self.state, &self.registry);
                RequestResult::Ready(Ok(()))
            }
            MockJobBehavior::SyncError(error) => {
                self.state.borrow_mut().error_details = Some(ConnectErrorDetails {
                    failed_at: LoadState::Connecting,
                    os_error: None,
                });
                RequestResult::Ready(Err(error))
            }
            MockJobBehavior::PendingThenOk { delay, pending_state } => {
                self.state.borrow_mut().load_state = pending_state;
                let state = Rc::clone(&self.state);
                let registry = Rc::clone(&self.registry);
                let delegate = self.delegate.clone();
                self.task = Some(tokio::task::spawn_local(async move {
                    tokio::time::sleep(delay).await;
                    make_socket(&state, &registry);
                    delegate.on_connect_job_complete(Ok(()));
                }));
                RequestResult::Pending
            }
            MockJobBehavior::PendingThenError { delay, error } => {
                self.state.borrow_mut().load_state = LoadState::Connecting;
                let state = Rc::clone(&self.state);
                let delegate = self.delegate.clone();
                self.task = Some(tokio::task::spawn_local(async move {
                    tokio::time::sleep(delay).await;
                    state.borrow_mut().error_details = Some(ConnectErrorDetails {
                        failed_at: LoadState::Connecting,
                        os_error: None,
                    });
                    delegate.on_connect_job_complete(Err(error));
                }));
                RequestResult::Pending
            }
            MockJobBehavior::Stalled { load_state, established } => {
                let mut state = self.state.borrow_mut();
                state.load_state = load_state;
                state.established = established;
                RequestResult::Pending
            }
            MockJobBehavior::NeedsProxyAuth { delay } => {
                self.state.borrow_mut().load_state = LoadState::EstablishingProxyTunnel;
                let state = Rc::clone(&self.state);
                let registry = Rc::clone(&self.registry);
                let delegate = self.delegate.clone();
                self.task = Some(tokio::task::spawn_local(async move {
                    tokio::time::sleep(delay).await;
                    state.borrow_mut().established = true;
                    let restart_state = Rc::clone(&state);
                    let restart_registry = Rc::clone(&registry);
                    let restart_delegate = delegate.clone();
                    delegate.on_needs_proxy_auth(ProxyAuthChallenge {
                        response_headers: "HTTP/1.1 407 Proxy Authentication Required\r\n\r\n"
                            .to_string(),
                        restart_with_auth: Box::new(move || {
                            make_socket(&restart_state, &restart_registry);
                            restart_delegate.on_connect_job_complete(Ok(()));
                        }),
                    });
                }));
                RequestResult::Pending
            }
        }
    }

    fn priority(&self) -> RequestPriority {
        self.priority
    }

    fn change_priority(&mut self, priority: RequestPriority) {
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

impl Drop for MockConnectJob {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Creates scripted jobs: queued behaviors first (in order), then the
/// default for every later job.
pub struct MockConnectJobFactory {
    default_behavior: MockJobBehavior,
    behaviors: RefCell<VecDeque<MockJobBehavior>>,
    jobs_created: Cell<usize>,
    socket_controls: SocketControlRegistry,
}

impl MockConnectJobFactory {
    pub fn new(default_behavior: MockJobBehavior) -> Self {
        Self {
            default_behavior,
            behaviors: RefCell::new(VecDeque::new()),
            jobs_created: Cell::new(0),
            socket_controls: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn sync_ok() -> Self {
        Self::new(MockJobBehavior::SyncOk)
    }

    /// Script the behavior of the next job(s) to be created.
    pub fn enqueue(&self, behavior: MockJobBehavior) {
        self.behaviors.borrow_mut().push_back(behavior);
    }

    pub fn jobs_created(&self) -> usize {
        self.jobs_created.get()
    }

    /// Controls for every socket produced so far, in creation order.
    pub fn socket_controls(&self) -> Vec<FakeSocketControl> {
        self.socket_controls.borrow().clone()
    }
}

impl ConnectJobFactory for MockConnectJobFactory {
    fn new_connect_job(
        &self,
        _group_id: &GroupId,
        priority: RequestPriority,
        delegate: ConnectJobDelegate,
    ) -> Box<dyn ConnectJob> {
        self.jobs_created.set(self.jobs_created.get() + 1);
        let behavior = self
            .behaviors
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| self.default_behavior.clone());
        Box::new(MockConnectJob::new(
            behavior,
            priority,
            delegate,
            Rc::clone(&self.socket_controls),
        ))
    }
}
