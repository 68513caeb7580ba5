//! # Utility Modules
//!
//! Supporting pieces shared by the transport and service layers.
//!
//! ## Components
//! - **ThreadSafeQueue**: mutex-guarded double-ended queue
//! - **Completion**: single-shot outcome handles for async operations
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//! - **Time**: Timestamp utilities

pub mod completion;
pub mod logging;
pub mod metrics;
pub mod time;
pub mod ts_queue;

pub use completion::{Completion, Resolver};
pub use metrics::{Metrics, MetricsSnapshot};
pub use ts_queue::ThreadSafeQueue;
