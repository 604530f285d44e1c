//! # sockpool
//!
//! A Chromium-inspired transport socket pool for Rust.
//!
//! `sockpool` manages connected transport sockets per destination under two
//! interacting capacity limits (a global budget and a per-group budget), with
//! priority-ordered admission, backup connect jobs that hedge against stalled
//! TCP handshakes, late binding of in-flight connect attempts to waiting
//! requests, idle-socket reuse with age- and usability-based eviction, and
//! generation counters that invalidate pooled state after network or TLS
//! configuration changes.
//!
//! ## Features
//!
//! - **Two-level budgets**: 6 sockets per destination group, 256 total
//!   (Chromium-compatible defaults, configurable per pool)
//! - **Priority scheduling**: six priority levels, FIFO within a level,
//!   with connect-job stealing on reprioritization
//! - **Backup connect jobs**: a second connect attempt races the first after
//!   a 250 ms retry interval
//! - **Layered pools**: higher-layer consumers can be asked to release an
//!   idle connection when the pool stalls on the global limit
//! - **Lazy invalidation**: generation bumps retire pooled sockets after
//!   IP-address or SSL-configuration changes without traversing them
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sockpool::socket::connectjob::TransportConnectJobFactory;
//! use sockpool::socket::group_id::GroupId;
//! use sockpool::socket::handle::ClientSocketHandle;
//! use sockpool::socket::pool::{RequestParams, TransportClientSocketPool, TransportPoolParams};
//! use std::rc::Rc;
//!
//! let local = tokio::task::LocalSet::new();
//! local.run_until(async {
//!     let pool = TransportClientSocketPool::new(
//!         TransportPoolParams::default(),
//!         Rc::new(TransportConnectJobFactory::default()),
//!     );
//!     let group_id = GroupId::new("http", "example.com", 80);
//!     let handle = ClientSocketHandle::new();
//!     pool.request_socket(&group_id, &handle, RequestParams::default(), Box::new(|result| {
//!         println!("socket ready: {:?}", result);
//!     }));
//! }).await;
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Core types: error codes, load states, request priorities
//! - [`socket`] - The pool, groups, connect jobs, handles, and sockets
//!
//! The pool is single-threaded cooperative: it is `!Send`, shares state via
//! `Rc`, and must be created and driven inside a `tokio::task::LocalSet` on
//! a current-thread runtime. User callbacks are never invoked reentrantly
//! from the API call that produced them; completions are delivered through a
//! posted-task queue on the same task runner.

pub mod base;
pub mod socket;
