//! Caller-side socket slot.
//!
//! A `ClientSocketHandle` is the slot a caller passes to the pool when
//! requesting a socket. On success the pool fills it with the socket, the
//! reuse classification, the time the socket sat idle, and the generation of
//! the group that produced it (needed to release the socket back). Handle
//! identity keys the pool's posted-callback map, so cancelling a request by
//! handle also scrubs an already-posted completion.

use crate::base::loadstate::LoadState;
use crate::socket::stream::StreamSocket;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

/// How the socket in a handle was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketReuseType {
    /// Fresh from a connect job.
    #[default]
    Unused,
    /// From the idle list, but never used for data transfer (e.g. a
    /// preconnected socket).
    UnusedIdle,
    /// From the idle list, previously used for data transfer.
    ReusedIdle,
}

/// Extra error state transferred from a failed connect job, so the caller
/// can inspect where the attempt died.
#[derive(Debug, Clone, Default)]
pub struct ConnectErrorDetails {
    /// Connect stage at which the failure occurred.
    pub failed_at: LoadState,
    /// Raw OS error code, when the failure came from a syscall.
    pub os_error: Option<i32>,
}

#[derive(Default)]
struct HandleState {
    socket: Option<Box<dyn StreamSocket>>,
    reuse_type: SocketReuseType,
    idle_time: Duration,
    group_generation: i64,
    connect_error_details: Option<ConnectErrorDetails>,
}

/// Cheaply cloneable; all clones refer to the same slot.
#[derive(Clone)]
pub struct ClientSocketHandle {
    id: HandleId,
    state: Rc<RefCell<HandleState>>,
}

impl ClientSocketHandle {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            id: HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)),
            state: Rc::new(RefCell::new(HandleState::default())),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// True once the pool has delivered a socket.
    pub fn has_socket(&self) -> bool {
        self.state.borrow().socket.is_some()
    }

    /// Take the delivered socket out of the handle.
    pub fn pass_socket(&self) -> Option<Box<dyn StreamSocket>> {
        self.state.borrow_mut().socket.take()
    }

    pub fn reuse_type(&self) -> SocketReuseType {
        self.state.borrow().reuse_type
    }

    pub fn is_reused(&self) -> bool {
        self.reuse_type() == SocketReuseType::ReusedIdle
    }

    /// How long the socket sat idle before being handed out.
    pub fn idle_time(&self) -> Duration {
        self.state.borrow().idle_time
    }

    /// Generation of the owning group at hand-out time. Must be passed back
    /// to `release_socket`; a stale generation discards the socket.
    pub fn group_generation(&self) -> i64 {
        self.state.borrow().group_generation
    }

    pub fn connect_error_details(&self) -> Option<ConnectErrorDetails> {
        self.state.borrow().connect_error_details.clone()
    }

    pub(crate) fn set_socket(
        &self,
        socket: Box<dyn StreamSocket>,
        reuse_type: SocketReuseType,
        idle_time: Duration,
        group_generation: i64,
    ) {
        let mut state = self.state.borrow_mut();
        state.socket = Some(socket);
        state.reuse_type = reuse_type;
        state.idle_time = idle_time;
        state.group_generation = group_generation;
    }

    pub(crate) fn set_connect_error_details(&self, details: ConnectErrorDetails) {
        self.state.borrow_mut().connect_error_details = Some(details);
    }

    /// Clear delivered state so the handle can be reused for a new request.
    pub fn reset(&self) {
        *self.state.borrow_mut() = HandleState::default();
    }
}

impl std::fmt::Debug for ClientSocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSocketHandle")
            .field("id", &self.id)
            .field("has_socket", &self.has_socket())
            .finish()
    }
}
