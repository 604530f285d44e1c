//! Socket pooling and connection management.
//!
//! Provides the transport socket pool mirroring Chromium's `net/socket/`:
//! - [`pool`]: Groups, budgets, admission, backup jobs
//! - [`connectjob`]: The connect-job interface and a thin DNS → TCP implementation
//! - [`group_id`]: Destination keys (scheme, host, port, privacy, tag)
//! - [`handle`]: The caller-side socket slot
//! - [`request_queue`]: Priority queue with stable cursor walks
//! - [`stream`]: The `StreamSocket` trait and a TCP implementation
//! - [`test_util`]: Mock jobs and fake sockets for tests and benches

use crate::base::neterror::NetError;

pub mod connectjob;
pub mod group_id;
pub mod handle;
pub mod pool;
pub mod request_queue;
pub mod stream;
pub mod test_util;

/// Outcome of starting an operation that may complete asynchronously.
///
/// `Pending` is not an error: it promises exactly one later completion
/// callback. `Ready` completes the operation synchronously and the callback
/// is never invoked.
#[derive(Debug)]
#[must_use]
pub enum RequestResult {
    Ready(Result<(), NetError>),
    Pending,
}

impl RequestResult {
    pub fn is_pending(&self) -> bool {
        matches!(self, RequestResult::Pending)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RequestResult::Ready(Ok(())))
    }
}
