//! The transport socket pool.
//!
//! Manages connected sockets per destination group under two interacting
//! budgets (global and per-group), with priority-ordered admission, backup
//! connect jobs, late binding of connect jobs to requests that can answer
//! proxy auth challenges, idle-socket lifecycle, and generation-based
//! invalidation. Mirrors Chromium's `TransportClientSocketPool`.
//!
//! Concurrency model: single-threaded cooperative. The pool is `!Send` and
//! must be created and used inside a `tokio::task::LocalSet`. User callbacks
//! are never invoked reentrantly from the call that produced them; they are
//! delivered through a posted-task queue drained on the same task runner.

use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::base::priority::{RequestPriority, MAXIMUM_PRIORITY};
use crate::socket::connectjob::{
    ConnectJob, ConnectJobDelegate, ConnectJobFactory, JobId, ProxyAuthChallenge,
};
use crate::socket::group_id::GroupId;
use crate::socket::handle::{ClientSocketHandle, HandleId, SocketReuseType};
use crate::socket::request_queue::{Pointer, RequestQueue};
use crate::socket::stream::StreamSocket;
use crate::socket::RequestResult;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// One-shot completion callback. Runs at most once, from the task runner,
/// and only if the operation returned [`RequestResult::Pending`].
pub type CompletionOnceCallback = Box<dyn FnOnce(Result<(), NetError>)>;

/// Callback invoked when a bound connect job needs proxy authentication.
/// May run more than once (one round per challenge).
pub type ProxyAuthCallback = Rc<dyn Fn(ProxyAuthChallenge)>;

/// Whether a request counts against the pool's socket budgets.
///
/// `Disabled` requests (used for a small class of urgent work) bypass both
/// limits and must be submitted at the maximum priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RespectLimits {
    #[default]
    Enabled,
    Disabled,
}

/// Per-request behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestFlags {
    /// Do not reuse an idle socket; always wait for (or start) a connect
    /// job. Set internally for preconnects.
    pub no_idle_sockets: bool,
}

/// Everything about a socket request except the handle and callback.
#[derive(Default)]
pub struct RequestParams {
    pub priority: RequestPriority,
    pub respect_limits: RespectLimits,
    pub flags: RequestFlags,
    /// If set, the request can handle proxy auth challenges, making it a
    /// candidate for late binding to a challenged connect job.
    pub proxy_auth_callback: Option<ProxyAuthCallback>,
}

/// Pool tunables. Defaults match Chromium's transport pool.
#[derive(Debug, Clone)]
pub struct TransportPoolParams {
    /// Global socket budget across all groups.
    pub max_sockets: usize,
    /// Socket budget per destination group.
    pub max_sockets_per_group: usize,
    /// How long a never-used idle socket may sit in the pool.
    pub unused_idle_socket_timeout: Duration,
    /// How long a previously-used idle socket may sit in the pool.
    pub used_idle_socket_timeout: Duration,
    /// Delay before a backup connect job races the first one.
    pub connect_retry_interval: Duration,
    pub connect_backup_jobs_enabled: bool,
    /// Flush the pool when the embedder reports an IP address change.
    pub cleanup_on_ip_address_change: bool,
}

impl Default for TransportPoolParams {
    fn default() -> Self {
        Self {
            max_sockets: 256,
            max_sockets_per_group: 6,
            unused_idle_socket_timeout: Duration::from_secs(10),
            used_idle_socket_timeout: Duration::from_secs(300),
            connect_retry_interval: Duration::from_millis(250),
            connect_backup_jobs_enabled: true,
            cleanup_on_ip_address_change: true,
        }
    }
}

/// Which part of the TLS configuration changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslConfigChangeKind {
    SslConfigChanged,
    CertDatabaseChanged,
    CertVerifierChanged,
}

/// A downstream consumer that may hold pool sockets active (for example, a
/// session multiplexer with no outstanding streams) and can release one on
/// request. Implementations may call back into the pool.
pub trait HigherLayeredPool {
    /// Close one idle connection, freeing a socket slot. Returns true if a
    /// connection was closed.
    fn close_one_idle_connection(&self) -> bool;
}

/// Serializable per-group diagnostics.
#[derive(Debug, Serialize)]
pub struct GroupInfo {
    pub pending_request_count: usize,
    pub active_socket_count: usize,
    pub idle_socket_count: usize,
    pub connect_job_count: usize,
    pub is_stalled: bool,
    pub backup_job_timer_is_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_pending_priority: Option<&'static str>,
}

/// Serializable pool diagnostics, mirroring Chromium's `GetInfoAsValue`.
#[derive(Debug, Serialize)]
pub struct PoolInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub pool_type: String,
    pub handed_out_socket_count: usize,
    pub connecting_socket_count: usize,
    pub idle_socket_count: usize,
    pub max_socket_count: usize,
    pub max_sockets_per_group: usize,
    pub groups: BTreeMap<String, GroupInfo>,
}

enum PoolTask {
    InvokeUserCallback(HandleId),
    TryToCloseSocketsInLayeredPools,
    BackupJobTimerFired(GroupId),
    Run(Box<dyn FnOnce()>),
}

struct CallbackResultPair {
    callback: CompletionOnceCallback,
    result: Result<(), NetError>,
}

/// Counts down as preconnect jobs settle; posts the completion callback when
/// all have. Guards are attached to pending jobs so that cancellation and
/// flushes still settle the count.
struct PreconnectBarrier {
    remaining: Cell<usize>,
    callback: RefCell<Option<CompletionOnceCallback>>,
    task_tx: mpsc::UnboundedSender<PoolTask>,
}

impl PreconnectBarrier {
    fn new(
        count: usize,
        callback: CompletionOnceCallback,
        task_tx: mpsc::UnboundedSender<PoolTask>,
    ) -> Self {
        Self { remaining: Cell::new(count), callback: RefCell::new(Some(callback)), task_tx }
    }

    fn decrement(&self) {
        let remaining = self.remaining.get().saturating_sub(1);
        self.remaining.set(remaining);
        if remaining == 0 {
            if let Some(callback) = self.callback.borrow_mut().take() {
                let _ = self
                    .task_tx
                    .send(PoolTask::Run(Box::new(move || callback(Ok(())))));
            }
        }
    }

    /// Drop the callback without running it (fully synchronous preconnect).
    fn defuse(&self) {
        self.callback.borrow_mut().take();
    }
}

struct PreconnectDoneGuard {
    barrier: Rc<PreconnectBarrier>,
}

impl Drop for PreconnectDoneGuard {
    fn drop(&mut self) {
        self.barrier.decrement();
    }
}

/// One caller's outstanding ask for a socket.
struct Request {
    handle: Option<ClientSocketHandle>,
    callback: Option<CompletionOnceCallback>,
    proxy_auth_callback: Option<ProxyAuthCallback>,
    priority: RequestPriority,
    respect_limits: RespectLimits,
    flags: RequestFlags,
    /// Assigned connect job, if any. A relation, not ownership: the job
    /// lives in the group's job list.
    job: Option<JobId>,
}

impl Request {
    fn new(
        handle: ClientSocketHandle,
        callback: CompletionOnceCallback,
        params: RequestParams,
    ) -> Self {
        assert!(
            params.respect_limits == RespectLimits::Enabled
                || params.priority == MAXIMUM_PRIORITY,
            "limit-ignoring requests must use the maximum priority"
        );
        Self {
            handle: Some(handle),
            callback: Some(callback),
            proxy_auth_callback: params.proxy_auth_callback,
            priority: params.priority,
            respect_limits: params.respect_limits,
            flags: params.flags,
            job: None,
        }
    }

    fn handle_id(&self) -> Option<HandleId> {
        self.handle.as_ref().map(ClientSocketHandle::id)
    }

    fn view(&self) -> RequestView {
        RequestView {
            handle: self.handle.clone(),
            priority: self.priority,
            respect_limits: self.respect_limits,
            flags: self.flags,
        }
    }
}

/// The slice of a request that admission needs. Cheap to clone, so the
/// request itself can stay queued while admission re-runs for it.
struct RequestView {
    handle: Option<ClientSocketHandle>,
    priority: RequestPriority,
    respect_limits: RespectLimits,
    flags: RequestFlags,
}

struct IdleSocket {
    socket: Box<dyn StreamSocket>,
    start_time: Instant,
}

impl IdleSocket {
    /// An idle socket can't be used if it is disconnected or has been used
    /// before and has received data unexpectedly (hence no longer idle).
    /// The unread data would be mistaken for the beginning of the next
    /// response if we were to use the socket for a new request.
    ///
    /// A socket that has never been used before (like a preconnected
    /// socket) may be used even with unread data; that may be, e.g., an
    /// early server greeting.
    fn is_usable(&self) -> Result<(), &'static str> {
        if self.socket.was_ever_used() {
            if !self.socket.is_connected_and_idle() {
                if !self.socket.is_connected() {
                    return Err(TransportClientSocketPool::REMOTE_SIDE_CLOSED_CONNECTION);
                }
                return Err(TransportClientSocketPool::DATA_RECEIVED_UNEXPECTEDLY);
            }
            return Ok(());
        }

        if !self.socket.is_connected() {
            return Err(TransportClientSocketPool::REMOTE_SIDE_CLOSED_CONNECTION);
        }
        Ok(())
    }
}

/// A connect job together with its pool-unique id and, for preconnects, the
/// barrier guard that settles the preconnect callback when the job dies.
struct JobEntry {
    id: JobId,
    job: Box<dyn ConnectJob>,
    preconnect_done: Option<PreconnectDoneGuard>,
}

/// A (request, job) pair created by late binding after a proxy auth
/// challenge. The job's completion goes directly to this request.
struct BoundRequest {
    job: JobEntry,
    request: Request,
    /// Group generation at bind time; a mismatch at completion discards the
    /// socket and requeues the request.
    generation: i64,
    /// Set by a flush while bound; delivered on the next job completion so
    /// the owner sees exactly one terminal event.
    pending_error: Option<NetError>,
}

/// Per-destination state: job/request pairing, idle sockets, and the backup
/// job timer.
struct Group {
    group_id: GroupId,
    /// In-flight unbound connect jobs, oldest first.
    jobs: Vec<JobEntry>,
    /// Jobs not assigned to any request (preconnects, or orphaned by
    /// request removal), in assignment-preference order.
    unassigned_jobs: VecDeque<JobId>,
    unbound_requests: RequestQueue<Request>,
    bound_requests: Vec<BoundRequest>,
    /// Oldest first.
    idle_sockets: VecDeque<IdleSocket>,
    active_socket_count: usize,
    /// Preconnect jobs not yet claimed by any request.
    never_assigned_job_count: usize,
    generation: i64,
    backup_job_timer: Option<tokio::task::JoinHandle<()>>,
}

impl Group {
    fn new(group_id: GroupId) -> Self {
        Self {
            group_id,
            jobs: Vec::new(),
            unassigned_jobs: VecDeque::new(),
            unbound_requests: RequestQueue::new(),
            bound_requests: Vec::new(),
            idle_sockets: VecDeque::new(),
            active_socket_count: 0,
            never_assigned_job_count: 0,
            generation: 0,
            backup_job_timer: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.active_socket_count == 0
            && self.idle_sockets.is_empty()
            && self.jobs.is_empty()
            && self.unbound_requests.is_empty()
            && self.bound_requests.is_empty()
    }

    fn connect_job_count(&self) -> usize {
        self.jobs.len() + self.bound_requests.len()
    }

    /// Slots this group occupies against the per-group budget.
    fn num_active_socket_slots(&self) -> usize {
        self.active_socket_count
            + self.jobs.len()
            + self.bound_requests.len()
            + self.idle_sockets.len()
    }

    fn has_available_socket_slot(&self, max_sockets_per_group: usize) -> bool {
        self.num_active_socket_slots() < max_sockets_per_group
    }

    /// True when the group both has room for another socket and has a
    /// request that no job is working for, so it would use a freed slot.
    fn can_use_additional_socket_slot(&self, max_sockets_per_group: usize) -> bool {
        self.has_available_socket_slot(max_sockets_per_group)
            && self.unbound_requests.len() > self.jobs.len()
    }

    fn has_unbound_requests(&self) -> bool {
        !self.unbound_requests.is_empty()
    }

    fn unbound_request_count(&self) -> usize {
        self.unbound_requests.len()
    }

    fn top_pending_priority(&self) -> Option<RequestPriority> {
        self.unbound_requests.first_max().map(|pointer| pointer.priority())
    }

    fn increment_generation(&mut self) {
        self.generation += 1;
    }

    fn job_entry_mut(&mut self, job_id: JobId) -> Option<&mut JobEntry> {
        self.jobs.iter_mut().find(|entry| entry.id == job_id)
    }

    fn insert_unbound_request(&mut self, request: Request) {
        self.sanity_check();
        debug_assert!(request.job.is_none());

        let priority = request.priority;
        let pointer = if request.respect_limits == RespectLimits::Disabled {
            // Requests that ignore limits (which must be at the maximum
            // priority) go ahead of other maximum-priority requests.
            debug_assert_eq!(priority, MAXIMUM_PRIORITY);
            self.unbound_requests.insert_at_front(request, priority)
        } else {
            self.unbound_requests.insert(request, priority)
        };

        self.try_to_assign_job_to_request(pointer);
        self.sanity_check();
    }

    fn get_next_unbound_request(&self) -> Option<&Request> {
        self.unbound_requests.first_max().map(|pointer| self.unbound_requests.get(pointer))
    }

    fn pop_next_unbound_request(&mut self) -> Option<Request> {
        let pointer = self.unbound_requests.first_max()?;
        Some(self.remove_unbound_request(pointer))
    }

    fn find_and_remove_unbound_request(&mut self, handle_id: HandleId) -> Option<Request> {
        let mut cursor = self.unbound_requests.first_max();
        while let Some(pointer) = cursor {
            if self.unbound_requests.get(pointer).handle_id() == Some(handle_id) {
                return Some(self.remove_unbound_request(pointer));
            }
            cursor = self.unbound_requests.get_next_towards_last_min(pointer);
        }
        None
    }

    fn remove_unbound_request(&mut self, pointer: Pointer) -> Request {
        self.sanity_check();

        let mut request = self.unbound_requests.erase(pointer);
        if let Some(job_id) = request.job.take() {
            self.try_to_assign_unassigned_job(job_id);
        }
        // If there are no more unbound requests, kill the backup timer.
        if self.unbound_requests.is_empty() {
            self.stop_backup_job_timer();
        }

        self.sanity_check();
        request
    }

    fn set_priority(&mut self, handle_id: HandleId, priority: RequestPriority) {
        let mut cursor = self.unbound_requests.first_max();
        while let Some(pointer) = cursor {
            if self.unbound_requests.get(pointer).handle_id() == Some(handle_id) {
                if self.unbound_requests.get(pointer).priority == priority {
                    return;
                }

                let mut request = self.remove_unbound_request(pointer);
                // Requests that ignore limits are created at the maximum
                // priority and stay there.
                debug_assert_eq!(request.respect_limits, RespectLimits::Enabled);
                request.priority = priority;
                self.insert_unbound_request(request);
                return;
            }
            cursor = self.unbound_requests.get_next_towards_last_min(pointer);
        }

        // Reprioritizing a request that already completed is a no-op.
        tracing::debug!(group = %self.group_id, "set_priority for a request no longer queued");
    }

    fn add_job(&mut self, entry: JobEntry, is_preconnect: bool) {
        self.sanity_check();

        if is_preconnect {
            self.never_assigned_job_count += 1;
        }
        let job_id = entry.id;
        self.jobs.push(entry);
        self.try_to_assign_unassigned_job(job_id);

        self.sanity_check();
    }

    fn remove_unbound_job(&mut self, job_id: JobId) -> JobEntry {
        self.sanity_check();

        let position = self
            .jobs
            .iter()
            .position(|entry| entry.id == job_id)
            .expect("removing a connect job that is not in the group");

        if let Some(unassigned_index) =
            self.unassigned_jobs.iter().position(|id| *id == job_id)
        {
            self.unassigned_jobs.remove(unassigned_index);
        } else {
            // The job is assigned to some request. Unassign it, then try to
            // replace it with another job (either an unassigned one or one
            // stolen from a lower-priority request).
            let pointer = self
                .find_unbound_request_with_job(job_id)
                .expect("an assigned job must have a requester");
            self.unbound_requests.get_mut(pointer).job = None;
            self.try_to_assign_job_to_request(pointer);
        }

        let entry = self.jobs.remove(position);
        if self.jobs.len() < self.never_assigned_job_count {
            self.never_assigned_job_count = self.jobs.len();
        }

        // With no jobs left this group no longer needs a backup job either.
        if self.jobs.is_empty() {
            debug_assert!(self.unassigned_jobs.is_empty());
            self.stop_backup_job_timer();
        }

        self.sanity_check();
        entry
    }

    fn remove_all_unbound_jobs(&mut self) {
        self.sanity_check();

        let mut cursor = self.unbound_requests.first_max();
        while let Some(pointer) = cursor {
            if self.unbound_requests.get(pointer).job.is_none() {
                break;
            }
            self.unbound_requests.get_mut(pointer).job = None;
            cursor = self.unbound_requests.get_next_towards_last_min(pointer);
        }
        self.unassigned_jobs.clear();
        self.never_assigned_job_count = 0;

        self.jobs.clear();
        self.stop_backup_job_timer();

        self.sanity_check();
    }

    fn try_to_use_never_assigned_connect_job(&mut self) -> bool {
        self.sanity_check();

        if self.never_assigned_job_count == 0 {
            return false;
        }
        self.never_assigned_job_count -= 1;
        true
    }

    /// Move `job_id` and the highest-priority request that can handle proxy
    /// auth into `bound_requests`. Returns the request's auth callback, or
    /// `None` if no waiting request can handle the challenge.
    fn bind_request_to_connect_job(&mut self, job_id: JobId) -> Option<ProxyAuthCallback> {
        // A second challenge on an already-bound job goes to the same
        // request.
        for bound in &self.bound_requests {
            if bound.job.id == job_id {
                return bound.request.proxy_auth_callback.clone();
            }
        }

        let pointer = self.unbound_requests.first_max()?;
        self.unbound_requests.get(pointer).proxy_auth_callback.as_ref()?;

        let request = self.pop_next_unbound_request().expect("peeked above");
        let job = self.remove_unbound_job(job_id);
        let callback = request.proxy_auth_callback.clone();
        self.bound_requests.push(BoundRequest {
            job,
            request,
            generation: self.generation,
            pending_error: None,
        });
        callback
    }

    fn find_and_remove_bound_request_for_connect_job(
        &mut self,
        job_id: JobId,
    ) -> Option<BoundRequest> {
        let position = self.bound_requests.iter().position(|bound| bound.job.id == job_id)?;
        Some(self.bound_requests.remove(position))
    }

    /// Remove the bound pair for `handle_id`, destroying its connect job.
    fn find_and_remove_bound_request(&mut self, handle_id: HandleId) -> Option<Request> {
        let position = self
            .bound_requests
            .iter()
            .position(|bound| bound.request.handle_id() == Some(handle_id))?;
        Some(self.bound_requests.remove(position).request)
    }

    fn set_pending_error_for_all_bound_requests(&mut self, error: NetError) {
        for bound in &mut self.bound_requests {
            // Earlier errors take precedence.
            if bound.pending_error.is_none() {
                bound.pending_error = Some(error.clone());
            }
        }
    }

    fn get_connect_job_load_state_for_handle(&self, handle_id: HandleId) -> Option<LoadState> {
        for bound in &self.bound_requests {
            if bound.request.handle_id() == Some(handle_id) {
                return Some(bound.job.job.load_state());
            }
        }

        // Only the leading requests in priority order have jobs; stop at the
        // first request without one.
        let mut cursor = self.unbound_requests.first_max();
        while let Some(pointer) = cursor {
            let request = self.unbound_requests.get(pointer);
            let job_id = request.job?;
            if request.handle_id() == Some(handle_id) {
                return self
                    .jobs
                    .iter()
                    .find(|entry| entry.id == job_id)
                    .map(|entry| entry.job.load_state());
            }
            cursor = self.unbound_requests.get_next_towards_last_min(pointer);
        }
        None
    }

    fn find_unbound_request_with_job(&self, job_id: JobId) -> Option<Pointer> {
        let mut cursor = self.unbound_requests.first_max();
        while let Some(pointer) = cursor {
            match self.unbound_requests.get(pointer).job {
                Some(id) if id == job_id => return Some(pointer),
                Some(_) => {}
                None => return None,
            }
            cursor = self.unbound_requests.get_next_towards_last_min(pointer);
        }
        None
    }

    fn get_first_request_without_job(&self) -> Option<Pointer> {
        let mut cursor = self.unbound_requests.first_max();
        while let Some(pointer) = cursor {
            if self.unbound_requests.get(pointer).job.is_none() {
                return Some(pointer);
            }
            cursor = self.unbound_requests.get_next_towards_last_min(pointer);
        }
        None
    }

    /// Park `job_id` on the unassigned list, then hand it to the first
    /// request without a job, if any.
    fn try_to_assign_unassigned_job(&mut self, job_id: JobId) {
        self.unassigned_jobs.push_back(job_id);
        if let Some(pointer) = self.get_first_request_without_job() {
            let job_id = self.unassigned_jobs.pop_back().expect("pushed above");
            self.assign_job_to_request(pointer, job_id);
        }
    }

    /// Find a job for the (job-less) request at `pointer`: an unassigned
    /// one, or one stolen from the lowest-priority request that has one.
    fn try_to_assign_job_to_request(&mut self, pointer: Pointer) {
        debug_assert!(self.unbound_requests.get(pointer).job.is_none());
        if let Some(job_id) = self.unassigned_jobs.pop_front() {
            self.assign_job_to_request(pointer, job_id);
            return;
        }

        // If the next request in the queue has no job, there is no request
        // with a job after `pointer` to steal from.
        let Some(next) = self.unbound_requests.get_next_towards_last_min(pointer) else {
            return;
        };
        if self.unbound_requests.get(next).job.is_none() {
            return;
        }

        // Walk down the queue to the last request with a job.
        let mut current = next;
        while let Some(after) = self.unbound_requests.get_next_towards_last_min(current) {
            if self.unbound_requests.get(after).job.is_none() {
                break;
            }
            current = after;
        }

        let job_id = self
            .unbound_requests
            .get_mut(current)
            .job
            .take()
            .expect("walked to a request with a job");
        self.assign_job_to_request(pointer, job_id);
    }

    fn assign_job_to_request(&mut self, pointer: Pointer, job_id: JobId) {
        let priority = self.unbound_requests.get(pointer).priority;
        let entry = self
            .job_entry_mut(job_id)
            .expect("assigning a job that is not in the group");
        if entry.job.priority() != priority {
            entry.job.change_priority(priority);
        }

        let request = self.unbound_requests.get_mut(pointer);
        debug_assert!(request.job.is_none());
        request.job = Some(job_id);
    }

    /// Drop unusable idle sockets, then pick one to hand out: the newest
    /// previously-used socket if any, else the oldest (FIFO). Returns the
    /// number of sockets closed and the pick.
    fn take_usable_idle_socket(&mut self) -> (usize, Option<IdleSocket>) {
        let mut closed = 0;
        let mut newest_used = None;
        let mut i = 0;
        while i < self.idle_sockets.len() {
            match self.idle_sockets[i].is_usable() {
                Err(reason) => {
                    tracing::debug!(group = %self.group_id, reason, "closing idle socket");
                    self.idle_sockets.remove(i);
                    closed += 1;
                }
                Ok(()) => {
                    if self.idle_sockets[i].socket.was_ever_used() {
                        newest_used = Some(i);
                    }
                    i += 1;
                }
            }
        }

        if self.idle_sockets.is_empty() {
            return (closed, None);
        }
        let pick = newest_used.unwrap_or(0);
        (closed, self.idle_sockets.remove(pick))
    }

    /// Close idle sockets that timed out or became unusable; close all of
    /// them when `force` is set. Returns the number closed. Timeout reasons
    /// override the caller's reason; usability reasons override both.
    fn cleanup_idle_sockets(
        &mut self,
        force: bool,
        now: Instant,
        reason: Option<&str>,
        unused_idle_socket_timeout: Duration,
        used_idle_socket_timeout: Duration,
    ) -> usize {
        debug_assert!(!force || reason.is_some());

        let mut closed = 0;
        let mut i = 0;
        while i < self.idle_sockets.len() {
            let idle = &self.idle_sockets[i];
            let mut should_close = force;
            let mut close_reason = reason;

            let timeout = if idle.socket.was_ever_used() {
                used_idle_socket_timeout
            } else {
                unused_idle_socket_timeout
            };
            if now.duration_since(idle.start_time) >= timeout {
                should_close = true;
                close_reason = Some(TransportClientSocketPool::IDLE_TIME_LIMIT_EXPIRED);
            }

            if let Err(usability_reason) = idle.is_usable() {
                should_close = true;
                close_reason = Some(usability_reason);
            }

            if should_close {
                let reason = close_reason.expect("closing an idle socket requires a reason");
                tracing::debug!(group = %self.group_id, reason, "closing idle socket");
                self.idle_sockets.remove(i);
                closed += 1;
            } else {
                i += 1;
            }
        }
        closed
    }

    fn start_backup_job_timer(
        &mut self,
        interval: Duration,
        task_tx: mpsc::UnboundedSender<PoolTask>,
    ) {
        // Only one timer at a time.
        if self.backup_job_timer_is_running() {
            return;
        }
        let group_id = self.group_id.clone();
        self.backup_job_timer = Some(tokio::task::spawn_local(async move {
            tokio::time::sleep(interval).await;
            let _ = task_tx.send(PoolTask::BackupJobTimerFired(group_id));
        }));
    }

    fn backup_job_timer_is_running(&self) -> bool {
        self.backup_job_timer.as_ref().is_some_and(|timer| !timer.is_finished())
    }

    fn stop_backup_job_timer(&mut self) {
        if let Some(timer) = self.backup_job_timer.take() {
            timer.abort();
        }
    }

    /// Structural invariants. These hold in release builds too; a violation
    /// is a pool bug, never recoverable state.
    fn sanity_check(&self) {
        assert!(self.never_assigned_job_count <= self.jobs.len());
        assert!(self.unassigned_jobs.len() <= self.jobs.len());

        // `unassigned_jobs` is empty iff there are at least as many requests
        // as jobs.
        assert_eq!(
            self.unassigned_jobs.is_empty(),
            self.jobs.len() <= self.unbound_requests.len()
        );

        let num_assigned_jobs = self.jobs.len() - self.unassigned_jobs.len();
        let mut seen_jobs: Vec<JobId> = Vec::new();
        let mut cursor = self.unbound_requests.first_max();
        let mut i = 0;
        while let Some(pointer) = cursor {
            let request = self.unbound_requests.get(pointer);
            if i < num_assigned_jobs {
                let job_id = request.job.expect("leading requests must have assigned jobs");
                assert!(!self.unassigned_jobs.contains(&job_id));
                let entry = self
                    .jobs
                    .iter()
                    .find(|entry| entry.id == job_id)
                    .expect("assigned job must be in the job list");
                assert!(!seen_jobs.contains(&job_id), "job assigned to two requests");
                seen_jobs.push(job_id);
                assert_eq!(entry.job.priority(), request.priority);
            } else {
                assert!(request.job.is_none(), "trailing requests must not have jobs");
            }
            i += 1;
            cursor = self.unbound_requests.get_next_towards_last_min(pointer);
        }

        for (index, job_id) in self.unassigned_jobs.iter().enumerate() {
            assert!(self.jobs.iter().any(|entry| entry.id == *job_id));
            assert!(!self
                .unassigned_jobs
                .iter()
                .skip(index + 1)
                .any(|other| other == job_id));
            assert!(!self.bound_requests.iter().any(|bound| bound.job.id == *job_id));
        }
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        self.stop_backup_job_timer();
    }
}

struct PoolState {
    group_map: BTreeMap<GroupId, Group>,
    handed_out_socket_count: usize,
    connecting_socket_count: usize,
    idle_socket_count: usize,
    higher_pools: Vec<Weak<dyn HigherLayeredPool>>,
    next_job_id: u64,
}

impl PoolState {
    fn alloc_job_id(&mut self) -> JobId {
        self.next_job_id += 1;
        JobId(self.next_job_id)
    }
}

/// A pool of transport sockets, keyed by [`GroupId`].
///
/// Create with [`TransportClientSocketPool::new`] inside a
/// `tokio::task::LocalSet`; the pool spawns its task runner there.
pub struct TransportClientSocketPool {
    params: TransportPoolParams,
    connect_job_factory: Rc<dyn ConnectJobFactory>,
    state: RefCell<PoolState>,
    /// Completions posted but not yet delivered, keyed by handle identity.
    /// Separate from `state` so barrier guards can settle mid-operation.
    pending_callbacks: RefCell<HashMap<HandleId, CallbackResultPair>>,
    task_tx: mpsc::UnboundedSender<PoolTask>,
    weak_self: RefCell<Weak<TransportClientSocketPool>>,
}

impl TransportClientSocketPool {
    // Stable idle-close reasons, logged verbatim. A diagnostic surface:
    // tooling matches on these strings.
    pub const CERT_DATABASE_CHANGED: &'static str = "Cert database changed";
    pub const CERT_VERIFIER_CHANGED: &'static str = "Cert verifier changed";
    pub const CLOSED_CONNECTION_RETURNED_TO_POOL: &'static str =
        "Connection was closed when it was returned to the pool";
    pub const DATA_RECEIVED_UNEXPECTEDLY: &'static str = "Data received unexpectedly";
    pub const IDLE_TIME_LIMIT_EXPIRED: &'static str = "Idle time limit expired";
    pub const NETWORK_CHANGED: &'static str = "Network changed";
    pub const REMOTE_SIDE_CLOSED_CONNECTION: &'static str = "Remote side closed connection";
    pub const SOCKET_GENERATION_OUT_OF_DATE: &'static str = "Socket generation out of date";
    pub const SOCKET_POOL_DESTROYED: &'static str = "Socket pool destroyed";
    pub const SSL_CONFIG_CHANGED: &'static str = "SSL configuration changed";

    /// Create a pool. Must be called inside a `tokio::task::LocalSet` on a
    /// current-thread runtime; the pool's task runner is spawned there.
    pub fn new(
        params: TransportPoolParams,
        connect_job_factory: Rc<dyn ConnectJobFactory>,
    ) -> Rc<Self> {
        assert!(params.max_sockets_per_group > 0);
        assert!(params.max_sockets_per_group <= params.max_sockets);

        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let pool = Rc::new(Self {
            params,
            connect_job_factory,
            state: RefCell::new(PoolState {
                group_map: BTreeMap::new(),
                handed_out_socket_count: 0,
                connecting_socket_count: 0,
                idle_socket_count: 0,
                higher_pools: Vec::new(),
                next_job_id: 0,
            }),
            pending_callbacks: RefCell::new(HashMap::new()),
            task_tx,
            weak_self: RefCell::new(Weak::new()),
        });
        *pool.weak_self.borrow_mut() = Rc::downgrade(&pool);

        let weak = Rc::downgrade(&pool);
        tokio::task::spawn_local(Self::run_posted_tasks(weak, task_rx));
        pool
    }

    async fn run_posted_tasks(
        pool: Weak<TransportClientSocketPool>,
        mut task_rx: mpsc::UnboundedReceiver<PoolTask>,
    ) {
        while let Some(task) = task_rx.recv().await {
            let Some(pool) = pool.upgrade() else {
                break;
            };
            match task {
                PoolTask::InvokeUserCallback(handle_id) => pool.invoke_user_callback(handle_id),
                PoolTask::TryToCloseSocketsInLayeredPools => {
                    pool.try_to_close_sockets_in_layered_pools()
                }
                PoolTask::BackupJobTimerFired(group_id) => {
                    pool.on_backup_job_timer_fired(&group_id)
                }
                PoolTask::Run(task) => task(),
            }
        }
    }

    /// Request a socket for `group_id`.
    ///
    /// Returns `Ready` if the request completed synchronously; the callback
    /// is then never invoked and a successful result means the handle holds
    /// the socket. Returns `Pending` otherwise: exactly one completion is
    /// later delivered through `callback` on the task runner, unless the
    /// request is cancelled first.
    pub fn request_socket(
        &self,
        group_id: &GroupId,
        handle: &ClientSocketHandle,
        params: RequestParams,
        callback: CompletionOnceCallback,
    ) -> RequestResult {
        let request = Request::new(handle.clone(), callback, params);

        let mut state_ref = self.state.borrow_mut();
        let state = &mut *state_ref;

        // Clean up any timed-out idle sockets.
        self.cleanup_idle_sockets(state, false, None);

        tracing::debug!(group = %group_id, priority = request.priority.name(), "socket requested");

        let view = request.view();
        let rv = self.request_socket_internal(state, group_id, &view, None);
        match rv {
            RequestResult::Pending => {
                let group = state
                    .group_map
                    .entry(group_id.clone())
                    .or_insert_with(|| Group::new(group_id.clone()));
                group.insert_unbound_request(request);
                // Closing sockets in higher level pools calls back into this
                // pool, so the layered-pool fallback runs from a posted task
                // rather than from inside this method.
                if group.can_use_additional_socket_slot(self.params.max_sockets_per_group) {
                    let _ = self.task_tx.send(PoolTask::TryToCloseSocketsInLayeredPools);
                }
                RequestResult::Pending
            }
            ready => ready,
        }
    }

    /// Fire up to `num_sockets` preconnect attempts for `group_id`, capped
    /// to the per-group budget.
    ///
    /// Individual connect failures are not surfaced; `callback` runs (with
    /// `Ok`) once every started attempt has settled. Returns `Ready(Ok)`
    /// when nothing was left pending, in which case the callback never runs.
    pub fn request_sockets(
        &self,
        group_id: &GroupId,
        num_sockets: usize,
        callback: CompletionOnceCallback,
    ) -> RequestResult {
        let mut state_ref = self.state.borrow_mut();
        let state = &mut *state_ref;

        // Clean up any timed-out idle sockets.
        self.cleanup_idle_sockets(state, false, None);

        let num_sockets = num_sockets.min(self.params.max_sockets_per_group);
        tracing::debug!(group = %group_id, num_sockets, "preconnecting sockets");

        state
            .group_map
            .entry(group_id.clone())
            .or_insert_with(|| Group::new(group_id.clone()));

        let barrier = Rc::new(PreconnectBarrier::new(
            num_sockets,
            callback,
            self.task_tx.clone(),
        ));
        let view = RequestView {
            handle: None,
            priority: RequestPriority::Idle,
            respect_limits: RespectLimits::Enabled,
            flags: RequestFlags { no_idle_sockets: true },
        };

        let mut pending_connect_job_count = 0;
        let mut iterations_left = num_sockets;
        loop {
            // A synchronous error may have deleted the group.
            let Some(group) = state.group_map.get(group_id) else {
                break;
            };
            if group.num_active_socket_slots() >= num_sockets || iterations_left == 0 {
                break;
            }
            iterations_left -= 1;

            match self.request_socket_internal(state, group_id, &view, Some(&barrier)) {
                RequestResult::Pending => pending_connect_job_count += 1,
                RequestResult::Ready(Ok(())) => {}
                RequestResult::Ready(Err(_)) => break,
            }
        }

        if state.group_map.get(group_id).is_some_and(Group::is_empty) {
            state.group_map.remove(group_id);
        }

        // Preconnect errors are not reported; attempts that never started
        // still settle the barrier here.
        if pending_connect_job_count == 0 {
            barrier.defuse();
            return RequestResult::Ready(Ok(()));
        }
        for _ in 0..(num_sockets - pending_connect_job_count) {
            barrier.decrement();
        }
        RequestResult::Pending
    }

    fn request_socket_internal(
        &self,
        state: &mut PoolState,
        group_id: &GroupId,
        request: &RequestView,
        preconnect_barrier: Option<&Rc<PreconnectBarrier>>,
    ) -> RequestResult {
        let preconnecting = request.handle.is_none();
        debug_assert_eq!(preconnecting, preconnect_barrier.is_some());

        if state.group_map.contains_key(group_id) {
            if !request.flags.no_idle_sockets {
                // Try to reuse a socket.
                if let Some((socket, idle_time, reuse_type)) =
                    self.take_idle_socket(state, group_id)
                {
                    let handle = request
                        .handle
                        .as_ref()
                        .expect("idle sockets are never assigned to preconnects");
                    self.hand_out_socket(state, group_id, socket, reuse_type, idle_time, handle);
                    return RequestResult::Ready(Ok(()));
                }
            }

            let group = state.group_map.get_mut(group_id).expect("checked above");

            // With more connect jobs than waiting requests, the extra job
            // will connect and then be assigned to this request.
            if !preconnecting && group.try_to_use_never_assigned_connect_job() {
                return RequestResult::Pending;
            }

            if !group.has_available_socket_slot(self.params.max_sockets_per_group)
                && request.respect_limits == RespectLimits::Enabled
            {
                tracing::debug!(group = %group_id, "request stalled on per-group limit");
                return if preconnecting {
                    RequestResult::Ready(Err(NetError::PreconnectMaxSocketLimit))
                } else {
                    RequestResult::Pending
                };
            }
        }

        if self.reached_max_sockets_limit(state)
            && request.respect_limits == RespectLimits::Enabled
        {
            if state.idle_socket_count > 0 {
                // An idle socket exists somewhere: either in this group (a
                // preconnect bypassing idle sockets) or in another group.
                // Close it to free a slot.
                let closed = self.close_one_idle_socket_except_in_group(state, Some(group_id));
                if preconnecting && !closed {
                    return RequestResult::Ready(Err(NetError::PreconnectMaxSocketLimit));
                }
            } else {
                tracing::debug!(group = %group_id, "request stalled on global socket limit");
                return if preconnecting {
                    RequestResult::Ready(Err(NetError::PreconnectMaxSocketLimit))
                } else {
                    RequestResult::Pending
                };
            }
        }

        // No socket to reuse and space to allocate one: connect a new one.
        let job_id = state.alloc_job_id();
        let delegate =
            ConnectJobDelegate::new(self.weak_self.borrow().clone(), group_id.clone(), job_id);
        let mut job =
            self.connect_job_factory
                .new_connect_job(group_id, request.priority, delegate);
        tracing::debug!(group = %group_id, backup_job = false, "created connect job");

        match job.connect() {
            RequestResult::Pending => {
                let entry = JobEntry {
                    id: job_id,
                    job,
                    preconnect_done: preconnect_barrier
                        .map(|barrier| PreconnectDoneGuard { barrier: Rc::clone(barrier) }),
                };
                let group = state
                    .group_map
                    .entry(group_id.clone())
                    .or_insert_with(|| Group::new(group_id.clone()));
                // If the group had no sockets, set a timer for potentially
                // creating a backup one. If the SYN is lost, the backup may
                // complete before the slow socket, improving user latency.
                if self.params.connect_backup_jobs_enabled && group.is_empty() {
                    group.start_backup_job_timer(
                        self.params.connect_retry_interval,
                        self.task_tx.clone(),
                    );
                }
                group.add_job(entry, preconnecting);
                state.connecting_socket_count += 1;
                RequestResult::Pending
            }
            RequestResult::Ready(result) => {
                if preconnecting {
                    if result.is_ok() {
                        let socket = job
                            .pass_socket()
                            .expect("successful connect job must produce a socket");
                        state
                            .group_map
                            .entry(group_id.clone())
                            .or_insert_with(|| Group::new(group_id.clone()));
                        self.add_idle_socket(state, group_id, socket);
                    }
                } else {
                    let handle = request.handle.as_ref().expect("checked above");
                    if result.is_err() {
                        if let Some(details) = job.connect_error_details() {
                            handle.set_connect_error_details(details);
                        }
                    }
                    if let Some(socket) = job.pass_socket() {
                        state
                            .group_map
                            .entry(group_id.clone())
                            .or_insert_with(|| Group::new(group_id.clone()));
                        self.hand_out_socket(
                            state,
                            group_id,
                            socket,
                            SocketReuseType::Unused,
                            Duration::ZERO,
                            handle,
                        );
                    }
                }
                if state.group_map.get(group_id).is_some_and(Group::is_empty) {
                    state.group_map.remove(group_id);
                }
                RequestResult::Ready(result)
            }
        }
    }

    /// Change the priority of a queued request. No-op once the request has
    /// completed.
    pub fn set_priority(
        &self,
        group_id: &GroupId,
        handle: &ClientSocketHandle,
        priority: RequestPriority,
    ) {
        let mut state = self.state.borrow_mut();
        match state.group_map.get_mut(group_id) {
            Some(group) => group.set_priority(handle.id(), priority),
            None => {
                // Already completed; nothing to reprioritize.
                tracing::debug!(group = %group_id, "set_priority for a completed request");
            }
        }
    }

    /// Cancel a request. After this returns, no callback is delivered for
    /// the handle. With `cancel_connect_job` set (or when the pool is at the
    /// global limit with no other waiter), the request's connect job is torn
    /// down as well.
    pub fn cancel_request(
        &self,
        group_id: &GroupId,
        handle: &ClientSocketHandle,
        cancel_connect_job: bool,
    ) {
        // A completion may already be posted but undelivered; scrub it and
        // recover the socket.
        let posted = self.pending_callbacks.borrow_mut().remove(&handle.id());
        if let Some(posted) = posted {
            if let Some(mut socket) = handle.pass_socket() {
                if posted.result.is_err() {
                    socket.disconnect();
                } else if cancel_connect_job {
                    let no_other_waiters = {
                        let state = self.state.borrow();
                        state
                            .group_map
                            .get(group_id)
                            .is_none_or(|group| group.unbound_request_count() == 0)
                    };
                    if no_other_waiters {
                        socket.disconnect();
                    }
                }
                self.release_socket(group_id, socket, handle.group_generation());
            }
            return;
        }

        let mut state_ref = self.state.borrow_mut();
        let state = &mut *state_ref;
        let (removed_bound, removed_unbound) = {
            let Some(group) = state.group_map.get_mut(group_id) else {
                tracing::debug!(group = %group_id, "cancel_request for unknown group");
                return;
            };
            let removed_bound = group.find_and_remove_bound_request(handle.id()).is_some();
            let removed_unbound = !removed_bound
                && group.find_and_remove_unbound_request(handle.id()).is_some();
            (removed_bound, removed_unbound)
        };

        if removed_bound {
            assert!(state.connecting_socket_count > 0);
            state.connecting_socket_count -= 1;
            self.on_available_socket_slot(state, group_id);
            self.check_for_stalled_socket_groups(state);
            return;
        }

        if removed_unbound {
            tracing::debug!(group = %group_id, "request cancelled");
            // Let the job run, unless `cancel_connect_job` is set or the
            // pool is at the socket limit with no other request waiting on
            // the job.
            let reached_limit = self.reached_max_sockets_limit(state);
            let group = state.group_map.get_mut(group_id).expect("group checked above");
            if group.jobs.len() > group.unbound_request_count()
                && (cancel_connect_job || reached_limit)
            {
                let oldest_job_id = group.jobs[0].id;
                self.remove_connect_job(state, group_id, oldest_job_id);
                if state.group_map.get(group_id).is_some_and(Group::is_empty) {
                    state.group_map.remove(group_id);
                }
                if reached_limit {
                    self.check_for_stalled_socket_groups(state);
                }
            }
        }
    }

    /// Return a handed-out socket. It becomes idle iff it is still usable
    /// and `generation` matches the group's current generation; otherwise it
    /// is closed with the appropriate reason.
    pub fn release_socket(
        &self,
        group_id: &GroupId,
        socket: Box<dyn StreamSocket>,
        generation: i64,
    ) {
        let mut state_ref = self.state.borrow_mut();
        let state = &mut *state_ref;

        let group = state
            .group_map
            .get_mut(group_id)
            .expect("released a socket for a group with no active sockets");
        assert!(group.active_socket_count > 0);
        group.active_socket_count -= 1;
        let current_generation = group.generation;
        assert!(state.handed_out_socket_count > 0);
        state.handed_out_socket_count -= 1;

        let reuse_reason = if !socket.is_connected_and_idle() {
            if !socket.is_connected() {
                Err(Self::CLOSED_CONNECTION_RETURNED_TO_POOL)
            } else {
                Err(Self::DATA_RECEIVED_UNEXPECTEDLY)
            }
        } else if generation != current_generation {
            Err(Self::SOCKET_GENERATION_OUT_OF_DATE)
        } else {
            Ok(())
        };

        match reuse_reason {
            Ok(()) => {
                self.add_idle_socket(state, group_id, socket);
                self.on_available_socket_slot(state, group_id);
            }
            Err(reason) => {
                tracing::debug!(group = %group_id, reason, "closing released socket");
                drop(socket);
                if state.group_map.get(group_id).is_some_and(Group::is_empty) {
                    state.group_map.remove(group_id);
                }
            }
        }

        self.check_for_stalled_socket_groups(state);
    }

    /// Close every idle socket, logging `reason` verbatim.
    pub fn close_idle_sockets(&self, reason: &str) {
        let mut state_ref = self.state.borrow_mut();
        let state = &mut *state_ref;
        self.cleanup_idle_sockets(state, true, Some(reason));
        debug_assert_eq!(state.idle_socket_count, 0);
    }

    /// Close the idle sockets of one group, logging `reason` verbatim.
    pub fn close_idle_sockets_in_group(&self, group_id: &GroupId, reason: &str) {
        let mut state_ref = self.state.borrow_mut();
        let state = &mut *state_ref;
        if state.idle_socket_count == 0 {
            return;
        }
        let Some(group) = state.group_map.get_mut(group_id) else {
            return;
        };
        let closed = group.cleanup_idle_sockets(
            true,
            Instant::now(),
            Some(reason),
            self.params.unused_idle_socket_timeout,
            self.params.used_idle_socket_timeout,
        );
        state.idle_socket_count -= closed;
        if state.group_map.get(group_id).is_some_and(Group::is_empty) {
            state.group_map.remove(group_id);
        }
    }

    /// Abort every connect job, close every idle socket with `reason`, fail
    /// every pending request with `error`, and advance group generations so
    /// later releases of pre-flush sockets discard them.
    pub fn flush_with_error(&self, error: NetError, reason: &str) {
        tracing::debug!(error = %error, reason, "flushing socket pool");
        let mut state_ref = self.state.borrow_mut();
        let state = &mut *state_ref;
        self.cancel_all_connect_jobs(state);
        self.cleanup_idle_sockets(state, true, Some(reason));
        self.cancel_all_requests_with_error(state, error);
        for group in state.group_map.values_mut() {
            group.increment_generation();
        }
    }

    /// Embedder notification: the machine's IP address changed.
    pub fn on_ip_address_changed(&self) {
        if self.params.cleanup_on_ip_address_change {
            self.flush_with_error(NetError::NetworkChanged, Self::NETWORK_CHANGED);
        }
    }

    /// Embedder notification: the SSL configuration changed globally. All
    /// groups are refreshed: unbound jobs cancelled, idle sockets closed,
    /// generations advanced. Active sockets finish but never return to the
    /// pool.
    pub fn on_ssl_config_changed(&self, kind: SslConfigChangeKind) {
        let reason = match kind {
            SslConfigChangeKind::SslConfigChanged => Self::SSL_CONFIG_CHANGED,
            SslConfigChangeKind::CertDatabaseChanged => Self::CERT_DATABASE_CHANGED,
            SslConfigChangeKind::CertVerifierChanged => Self::CERT_VERIFIER_CHANGED,
        };
        let mut state_ref = self.state.borrow_mut();
        let state = &mut *state_ref;
        let now = Instant::now();
        let group_ids: Vec<GroupId> = state.group_map.keys().cloned().collect();
        for group_id in group_ids {
            self.refresh_group(state, &group_id, now, reason);
        }
        self.check_for_stalled_socket_groups(state);
    }

    /// Embedder notification: the SSL configuration changed for specific
    /// servers. Only cryptographic groups destined for those servers are
    /// refreshed.
    pub fn on_ssl_config_for_servers_changed(&self, servers: &HashSet<(String, u16)>) {
        let mut state_ref = self.state.borrow_mut();
        let state = &mut *state_ref;
        let now = Instant::now();
        let group_ids: Vec<GroupId> = state
            .group_map
            .keys()
            .filter(|group_id| {
                group_id.is_cryptographic()
                    && servers.contains(&(group_id.host().to_string(), group_id.port()))
            })
            .cloned()
            .collect();
        let refreshed_any = !group_ids.is_empty();
        for group_id in group_ids {
            self.refresh_group(state, &group_id, now, Self::SSL_CONFIG_CHANGED);
        }
        if refreshed_any {
            // The freed slots go to the highest-priority stalled request.
            self.check_for_stalled_socket_groups(state);
        }
    }

    /// Load state for a pending request.
    pub fn get_load_state(&self, group_id: &GroupId, handle: &ClientSocketHandle) -> LoadState {
        if self.pending_callbacks.borrow().contains_key(&handle.id()) {
            return LoadState::Connecting;
        }

        let state = self.state.borrow();
        let Some(group) = state.group_map.get(group_id) else {
            tracing::debug!(group = %group_id, "load state queried for unknown group");
            return LoadState::Idle;
        };

        if let Some(load_state) = group.get_connect_job_load_state_for_handle(handle.id()) {
            return load_state;
        }

        if group.can_use_additional_socket_slot(self.params.max_sockets_per_group) {
            return LoadState::WaitingForStalledSocketPool;
        }
        LoadState::WaitingForAvailableSocket
    }

    /// True when the pool is at its global budget and some group has a
    /// request that a freed slot would serve.
    pub fn is_stalled(&self) -> bool {
        let state = self.state.borrow();
        // Below the global budget the pool is clearly not stalled.
        if state.handed_out_socket_count + state.connecting_socket_count < self.params.max_sockets
        {
            return false;
        }
        // Stalled also requires a request actually blocked on the global
        // limit: a group with more requests than jobs that is itself under
        // the per-group limit (at the per-group limit it is stalled on the
        // group limit instead, which does not count).
        state
            .group_map
            .values()
            .any(|group| group.can_use_additional_socket_slot(self.params.max_sockets_per_group))
    }

    /// True if the pool has state (sockets, jobs, or requests) for the
    /// group.
    pub fn has_active_socket(&self, group_id: &GroupId) -> bool {
        self.state.borrow().group_map.contains_key(group_id)
    }

    pub fn handed_out_socket_count(&self) -> usize {
        self.state.borrow().handed_out_socket_count
    }

    pub fn connecting_socket_count(&self) -> usize {
        self.state.borrow().connecting_socket_count
    }

    pub fn idle_socket_count(&self) -> usize {
        self.state.borrow().idle_socket_count
    }

    pub fn idle_socket_count_in_group(&self, group_id: &GroupId) -> usize {
        self.state
            .borrow()
            .group_map
            .get(group_id)
            .map_or(0, |group| group.idle_sockets.len())
    }

    /// Register a higher-layered pool to consult when stalled on the global
    /// budget. Only a weak reference is kept.
    pub fn add_higher_layered_pool(&self, higher_pool: &Rc<dyn HigherLayeredPool>) {
        let mut state = self.state.borrow_mut();
        assert!(
            !state
                .higher_pools
                .iter()
                .any(|weak| weak.upgrade().is_some_and(|pool| Rc::ptr_eq(&pool, higher_pool))),
            "higher layered pool registered twice"
        );
        state.higher_pools.push(Rc::downgrade(higher_pool));
    }

    pub fn remove_higher_layered_pool(&self, higher_pool: &Rc<dyn HigherLayeredPool>) {
        let mut state = self.state.borrow_mut();
        state
            .higher_pools
            .retain(|weak| weak.upgrade().is_some_and(|pool| !Rc::ptr_eq(&pool, higher_pool)));
    }

    /// Diagnostics snapshot.
    pub fn pool_info(&self, name: &str, pool_type: &str) -> PoolInfo {
        let state = self.state.borrow();
        let mut groups = BTreeMap::new();
        for (group_id, group) in &state.group_map {
            groups.insert(
                group_id.to_string(),
                GroupInfo {
                    pending_request_count: group.unbound_request_count(),
                    active_socket_count: group.active_socket_count,
                    idle_socket_count: group.idle_sockets.len(),
                    connect_job_count: group.connect_job_count(),
                    is_stalled: group
                        .can_use_additional_socket_slot(self.params.max_sockets_per_group),
                    backup_job_timer_is_running: group.backup_job_timer_is_running(),
                    top_pending_priority: group
                        .top_pending_priority()
                        .map(RequestPriority::name),
                },
            );
        }
        PoolInfo {
            name: name.to_string(),
            pool_type: pool_type.to_string(),
            handed_out_socket_count: state.handed_out_socket_count,
            connecting_socket_count: state.connecting_socket_count,
            idle_socket_count: state.idle_socket_count,
            max_socket_count: self.params.max_sockets,
            max_sockets_per_group: self.params.max_sockets_per_group,
            groups,
        }
    }

    /// Diagnostics snapshot as JSON.
    pub fn info_as_value(&self, name: &str, pool_type: &str) -> serde_json::Value {
        serde_json::to_value(self.pool_info(name, pool_type)).unwrap_or(serde_json::Value::Null)
    }

    /// Verify the pool-wide counter invariants and every group's structural
    /// invariants. Panics on violation.
    pub fn check_consistency(&self) {
        let state = self.state.borrow();
        let mut active = 0;
        let mut connecting = 0;
        let mut idle = 0;
        for group in state.group_map.values() {
            assert!(!group.is_empty(), "empty group retained in the group map");
            group.sanity_check();
            active += group.active_socket_count;
            connecting += group.connect_job_count();
            idle += group.idle_sockets.len();
        }
        assert_eq!(active, state.handed_out_socket_count);
        assert_eq!(connecting, state.connecting_socket_count);
        assert_eq!(idle, state.idle_socket_count);
    }

    // ---- Connect job delegate entry points ----

    pub(crate) fn on_connect_job_complete(
        &self,
        group_id: &GroupId,
        job_id: JobId,
        result: Result<(), NetError>,
    ) {
        let mut state_ref = self.state.borrow_mut();
        let state = &mut *state_ref;

        let (bound, request) = {
            let Some(group) = state.group_map.get_mut(group_id) else {
                tracing::debug!(group = %group_id, "connect job completed for a removed group");
                return;
            };
            // A job bound to a request delivers its result to that request
            // only.
            match group.find_and_remove_bound_request_for_connect_job(job_id) {
                Some(bound) => (Some(bound), None),
                None => (None, group.pop_next_unbound_request()),
            }
        };

        if let Some(bound) = bound {
            assert!(state.connecting_socket_count > 0);
            state.connecting_socket_count -= 1;
            self.complete_bound_request(state, group_id, bound, result);
            return;
        }

        let Some(mut request) = request else {
            if result.is_ok() {
                let socket = state
                    .group_map
                    .get_mut(group_id)
                    .and_then(|group| group.job_entry_mut(job_id))
                    .and_then(|entry| entry.job.pass_socket());
                if let Some(socket) = socket {
                    self.add_idle_socket(state, group_id, socket);
                }
            }
            self.remove_connect_job(state, group_id, job_id);
            self.on_available_socket_slot(state, group_id);
            self.check_for_stalled_socket_groups(state);
            return;
        };

        let handle = request.handle.clone().expect("queued requests have a handle");
        if result.is_err() {
            let details = state
                .group_map
                .get_mut(group_id)
                .and_then(|group| group.job_entry_mut(job_id))
                .and_then(|entry| entry.job.connect_error_details());
            if let Some(details) = details {
                handle.set_connect_error_details(details);
            }
        }
        let socket = state
            .group_map
            .get_mut(group_id)
            .and_then(|group| group.job_entry_mut(job_id))
            .and_then(|entry| entry.job.pass_socket());
        if let Some(socket) = socket {
            self.hand_out_socket(
                state,
                group_id,
                socket,
                SocketReuseType::Unused,
                Duration::ZERO,
                &handle,
            );
        }
        self.invoke_user_callback_later(
            handle.id(),
            request.callback.take().expect("queued requests have a callback"),
            result,
        );
        self.remove_connect_job(state, group_id, job_id);
        // If no socket was handed out, there's a new socket slot available.
        if !handle.has_socket() {
            self.on_available_socket_slot(state, group_id);
            self.check_for_stalled_socket_groups(state);
        }
    }

    fn complete_bound_request(
        &self,
        state: &mut PoolState,
        group_id: &GroupId,
        mut bound: BoundRequest,
        result: Result<(), NetError>,
    ) {
        // A flush happened while bound: deliver the flush error and discard
        // the socket.
        if let Some(error) = bound.pending_error {
            let handle = bound.request.handle.clone().expect("bound requests have a handle");
            self.invoke_user_callback_later(
                handle.id(),
                bound.request.callback.take().expect("bound requests have a callback"),
                Err(error),
            );
            drop(bound.job);
            self.on_available_socket_slot(state, group_id);
            self.check_for_stalled_socket_groups(state);
            return;
        }

        // The job is from a previous generation: requeue the request and
        // kick off another attempt. The socket is discarded.
        let current_generation = state
            .group_map
            .get(group_id)
            .expect("bound completion requires the group")
            .generation;
        if bound.generation != current_generation {
            let mut request = bound.request;
            request.job = None;
            drop(bound.job);
            state
                .group_map
                .get_mut(group_id)
                .expect("checked above")
                .insert_unbound_request(request);
            self.on_available_socket_slot(state, group_id);
            self.check_for_stalled_socket_groups(state);
            return;
        }

        let mut job = bound.job;
        let mut request = bound.request;
        let handle = request.handle.clone().expect("bound requests have a handle");
        if result.is_err() {
            if let Some(details) = job.job.connect_error_details() {
                handle.set_connect_error_details(details);
            }
        }
        if let Some(socket) = job.job.pass_socket() {
            self.hand_out_socket(
                state,
                group_id,
                socket,
                SocketReuseType::Unused,
                Duration::ZERO,
                &handle,
            );
        }
        self.invoke_user_callback_later(
            handle.id(),
            request.callback.take().expect("bound requests have a callback"),
            result,
        );
        if !handle.has_socket() {
            self.on_available_socket_slot(state, group_id);
            self.check_for_stalled_socket_groups(state);
        }
    }

    pub(crate) fn on_needs_proxy_auth(
        &self,
        group_id: &GroupId,
        job_id: JobId,
        challenge: ProxyAuthChallenge,
    ) {
        let callback = {
            let mut state = self.state.borrow_mut();
            let Some(group) = state.group_map.get_mut(group_id) else {
                return;
            };
            group.bind_request_to_connect_job(job_id)
        };
        match callback {
            // The borrow is released: the callback may call back in.
            Some(callback) => callback(challenge),
            // No waiting request can handle the challenge; treat it as a
            // connect job failure.
            None => self.on_connect_job_complete(
                group_id,
                job_id,
                Err(NetError::ProxyAuthRequested),
            ),
        }
    }

    // ---- Backup job ----

    fn on_backup_job_timer_fired(&self, group_id: &GroupId) {
        let mut state_ref = self.state.borrow_mut();
        let state = &mut *state_ref;

        let reached_limit = self.reached_max_sockets_limit(state);

        let Some(group) = state.group_map.get_mut(group_id) else {
            return;
        };
        group.backup_job_timer = None;

        // All jobs done before the timer fired.
        if group.jobs.is_empty() {
            return;
        }

        // Backup jobs only hedge against issues establishing the initial
        // TCP connection; once the oldest job has a connection, stand down.
        if group.jobs[0].job.has_established_connection() {
            return;
        }

        // Still waiting on DNS, or no room for another socket: try again
        // later.
        if reached_limit
            || !group.has_available_socket_slot(self.params.max_sockets_per_group)
            || group.jobs[0].job.load_state() == LoadState::ResolvingHost
        {
            group.start_backup_job_timer(
                self.params.connect_retry_interval,
                self.task_tx.clone(),
            );
            return;
        }

        if group.unbound_requests.is_empty() {
            return;
        }
        let priority = group
            .get_next_unbound_request()
            .expect("checked non-empty above")
            .priority;

        let job_id = state.alloc_job_id();
        let delegate =
            ConnectJobDelegate::new(self.weak_self.borrow().clone(), group_id.clone(), job_id);
        let mut job = self
            .connect_job_factory
            .new_connect_job(group_id, priority, delegate);
        tracing::debug!(group = %group_id, backup_job = true, "created connect job");

        let rv = job.connect();
        let group = state.group_map.get_mut(group_id).expect("group checked above");
        group.add_job(JobEntry { id: job_id, job, preconnect_done: None }, false);
        state.connecting_socket_count += 1;

        if let RequestResult::Ready(result) = rv {
            drop(state_ref);
            self.on_connect_job_complete(group_id, job_id, result);
        }
    }

    // ---- Posted callbacks ----

    fn invoke_user_callback_later(
        &self,
        handle_id: HandleId,
        callback: CompletionOnceCallback,
        result: Result<(), NetError>,
    ) {
        let mut pending = self.pending_callbacks.borrow_mut();
        assert!(
            !pending.contains_key(&handle_id),
            "second completion posted for one request"
        );
        pending.insert(handle_id, CallbackResultPair { callback, result });
        let _ = self.task_tx.send(PoolTask::InvokeUserCallback(handle_id));
    }

    fn invoke_user_callback(&self, handle_id: HandleId) {
        // Absent means the request was cancelled after the post.
        let pair = self.pending_callbacks.borrow_mut().remove(&handle_id);
        if let Some(pair) = pair {
            (pair.callback)(pair.result);
        }
    }

    // ---- Layered pool fallback ----

    fn try_to_close_sockets_in_layered_pools(&self) {
        while self.is_stalled() {
            // Closing a socket calls back into this pool to use the freed
            // slot, so nothing else is needed here.
            if !self.close_one_idle_connection_in_higher_layered_pool() {
                return;
            }
        }
    }

    /// This pool has no idle sockets of its own; a higher layer may be
    /// holding one of this pool's sockets active but actually idle. Ask.
    fn close_one_idle_connection_in_higher_layered_pool(&self) -> bool {
        let higher_pools: Vec<Rc<dyn HigherLayeredPool>> = self
            .state
            .borrow()
            .higher_pools
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for higher_pool in higher_pools {
            if higher_pool.close_one_idle_connection() {
                return true;
            }
        }
        false
    }

    // ---- Internal bookkeeping ----

    fn reached_max_sockets_limit(&self, state: &PoolState) -> bool {
        // Each connecting socket eventually connects and is handed out, so
        // it counts. The total can exceed the budget because some requests
        // ignore limits.
        let total = state.handed_out_socket_count
            + state.connecting_socket_count
            + state.idle_socket_count;
        total >= self.params.max_sockets
    }

    fn take_idle_socket(
        &self,
        state: &mut PoolState,
        group_id: &GroupId,
    ) -> Option<(Box<dyn StreamSocket>, Duration, SocketReuseType)> {
        let group = state.group_map.get_mut(group_id)?;
        let (closed, picked) = group.take_usable_idle_socket();
        state.idle_socket_count -= closed;
        let idle = picked?;
        state.idle_socket_count -= 1;

        let idle_time = idle.start_time.elapsed();
        let reuse_type = if idle.socket.was_ever_used() {
            SocketReuseType::ReusedIdle
        } else {
            SocketReuseType::UnusedIdle
        };
        Some((idle.socket, idle_time, reuse_type))
    }

    fn hand_out_socket(
        &self,
        state: &mut PoolState,
        group_id: &GroupId,
        socket: Box<dyn StreamSocket>,
        reuse_type: SocketReuseType,
        idle_time: Duration,
        handle: &ClientSocketHandle,
    ) {
        let group = state
            .group_map
            .get_mut(group_id)
            .expect("handing out a socket requires the group");
        group.active_socket_count += 1;
        let generation = group.generation;
        state.handed_out_socket_count += 1;

        if reuse_type == SocketReuseType::ReusedIdle {
            tracing::debug!(
                group = %group_id,
                idle_ms = idle_time.as_millis() as u64,
                "reusing an existing socket"
            );
        }
        handle.set_socket(socket, reuse_type, idle_time, generation);
    }

    fn add_idle_socket(
        &self,
        state: &mut PoolState,
        group_id: &GroupId,
        socket: Box<dyn StreamSocket>,
    ) {
        let group = state
            .group_map
            .get_mut(group_id)
            .expect("idling a socket requires the group");
        group
            .idle_sockets
            .push_back(IdleSocket { socket, start_time: Instant::now() });
        state.idle_socket_count += 1;
    }

    fn remove_connect_job(&self, state: &mut PoolState, group_id: &GroupId, job_id: JobId) {
        assert!(state.connecting_socket_count > 0);
        state.connecting_socket_count -= 1;
        let group = state
            .group_map
            .get_mut(group_id)
            .expect("removing a connect job requires the group");
        let entry = group.remove_unbound_job(job_id);
        drop(entry);
    }

    fn on_available_socket_slot(&self, state: &mut PoolState, group_id: &GroupId) {
        let Some(group) = state.group_map.get(group_id) else {
            return;
        };
        if group.is_empty() {
            state.group_map.remove(group_id);
        } else if group.has_unbound_requests() {
            self.process_pending_request(state, group_id);
        }
    }

    fn process_pending_request(&self, state: &mut PoolState, group_id: &GroupId) {
        let view = {
            let group = state.group_map.get(group_id).expect("caller checked the group");
            // With no idle sockets and no room for another job, either on
            // the per-group or the global budget, there is nothing to do.
            if group.idle_sockets.is_empty()
                && !group.can_use_additional_socket_slot(self.params.max_sockets_per_group)
            {
                return;
            }
            group
                .get_next_unbound_request()
                .expect("caller checked for unbound requests")
                .view()
        };

        let rv = self.request_socket_internal(state, group_id, &view, None);
        if let RequestResult::Ready(result) = rv {
            let group = state
                .group_map
                .get_mut(group_id)
                .expect("a group with queued requests is never removed");
            let mut request = group
                .pop_next_unbound_request()
                .expect("the peeked request is still queued");
            if group.is_empty() {
                state.group_map.remove(group_id);
            }
            let handle = request.handle.clone().expect("queued requests have a handle");
            self.invoke_user_callback_later(
                handle.id(),
                request.callback.take().expect("queued requests have a callback"),
                result,
            );
        }
    }

    fn check_for_stalled_socket_groups(&self, state: &mut PoolState) {
        // Loop until there's nothing more to do.
        loop {
            let Some(top_group_id) = self.find_top_stalled_group(state) else {
                return;
            };

            if self.reached_max_sockets_limit(state) {
                if state.idle_socket_count > 0 {
                    self.close_one_idle_socket_except_in_group(state, None);
                } else {
                    // Already at the global limit and nothing to close.
                    return;
                }
            }

            self.on_available_socket_slot(state, &top_group_id);
        }
    }

    /// The highest-priority pending request among groups under their
    /// per-group limit. Ties break by group map order (GroupId ordering).
    fn find_top_stalled_group(&self, state: &PoolState) -> Option<GroupId> {
        let mut top: Option<(&GroupId, RequestPriority)> = None;
        for (group_id, group) in &state.group_map {
            if !group.has_unbound_requests() {
                continue;
            }
            if !group.can_use_additional_socket_slot(self.params.max_sockets_per_group) {
                continue;
            }
            let priority = group.top_pending_priority().expect("checked for requests");
            if top.is_none_or(|(_, top_priority)| priority > top_priority) {
                top = Some((group_id, priority));
            }
        }
        top.map(|(group_id, _)| group_id.clone())
    }

    fn close_one_idle_socket_except_in_group(
        &self,
        state: &mut PoolState,
        exception_group: Option<&GroupId>,
    ) -> bool {
        debug_assert!(state.idle_socket_count > 0);

        let mut closed_in = None;
        for (group_id, group) in &mut state.group_map {
            if exception_group == Some(group_id) {
                continue;
            }
            if !group.idle_sockets.is_empty() {
                group.idle_sockets.pop_front();
                closed_in = Some(group_id.clone());
                break;
            }
        }

        let Some(group_id) = closed_in else {
            return false;
        };
        state.idle_socket_count -= 1;
        tracing::debug!(group = %group_id, "closed an idle socket to free a slot");
        if state.group_map.get(&group_id).is_some_and(Group::is_empty) {
            state.group_map.remove(&group_id);
        }
        true
    }

    fn cleanup_idle_sockets(&self, state: &mut PoolState, force: bool, reason: Option<&str>) {
        if state.idle_socket_count == 0 {
            return;
        }

        let now = Instant::now();
        let group_ids: Vec<GroupId> = state.group_map.keys().cloned().collect();
        for group_id in group_ids {
            let group = state.group_map.get_mut(&group_id).expect("key collected above");
            let closed = group.cleanup_idle_sockets(
                force,
                now,
                reason,
                self.params.unused_idle_socket_timeout,
                self.params.used_idle_socket_timeout,
            );
            let empty = group.is_empty();
            state.idle_socket_count -= closed;
            if empty {
                state.group_map.remove(&group_id);
            }
        }
    }

    fn cancel_all_connect_jobs(&self, state: &mut PoolState) {
        let group_ids: Vec<GroupId> = state.group_map.keys().cloned().collect();
        for group_id in group_ids {
            let group = state.group_map.get_mut(&group_id).expect("key collected above");
            let job_count = group.jobs.len();
            group.remove_all_unbound_jobs();
            let empty = group.is_empty();
            assert!(state.connecting_socket_count >= job_count);
            state.connecting_socket_count -= job_count;
            if empty {
                state.group_map.remove(&group_id);
            }
        }
    }

    fn cancel_all_requests_with_error(&self, state: &mut PoolState, error: NetError) {
        let group_ids: Vec<GroupId> = state.group_map.keys().cloned().collect();
        for group_id in group_ids {
            let group = state.group_map.get_mut(&group_id).expect("key collected above");
            while let Some(mut request) = group.pop_next_unbound_request() {
                let handle = request.handle.clone().expect("queued requests have a handle");
                self.invoke_user_callback_later(
                    handle.id(),
                    request.callback.take().expect("queued requests have a callback"),
                    Err(error.clone()),
                );
            }
            // Bound jobs can't fail immediately: their consumer may already
            // have a message in flight, and two terminal events for one
            // request is never safe. Mark them to fail on next completion.
            group.set_pending_error_for_all_bound_requests(error.clone());
            if group.is_empty() {
                state.group_map.remove(&group_id);
            }
        }
    }

    fn refresh_group(
        &self,
        state: &mut PoolState,
        group_id: &GroupId,
        now: Instant,
        reason: &'static str,
    ) {
        let group = state
            .group_map
            .get_mut(group_id)
            .expect("refreshing a group requires the group");
        let closed = group.cleanup_idle_sockets(
            true,
            now,
            Some(reason),
            self.params.unused_idle_socket_timeout,
            self.params.used_idle_socket_timeout,
        );
        let job_count = group.jobs.len();
        group.remove_all_unbound_jobs();
        // Prevent reuse of existing sockets.
        group.increment_generation();
        let empty = group.is_empty();

        state.idle_socket_count -= closed;
        assert!(state.connecting_socket_count >= job_count);
        state.connecting_socket_count -= job_count;
        if empty {
            state.group_map.remove(group_id);
        }
    }
}

impl Drop for TransportClientSocketPool {
    fn drop(&mut self) {
        let Ok(state) = self.state.try_borrow() else {
            return;
        };
        for (group_id, group) in &state.group_map {
            for _ in &group.idle_sockets {
                tracing::debug!(
                    group = %group_id,
                    reason = Self::SOCKET_POOL_DESTROYED,
                    "closing idle socket"
                );
            }
        }
    }
}
