//! Base types and error handling.
//!
//! Provides foundational types mirroring Chromium's `net/base/`:
//! - [`NetError`]: Network error codes matching `net_error_list.h`
//! - [`LoadState`]: Request loading states from `load_states_list.h`
//! - [`RequestPriority`]: Scheduling priorities from `request_priority.h`

pub mod loadstate;
pub mod neterror;
pub mod priority;

pub use loadstate::LoadState;
pub use neterror::NetError;
pub use priority::RequestPriority;
