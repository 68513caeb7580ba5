//! # Service Layer
//!
//! Client and server façades.
//!
//! Each interface owns an I/O [`executor`] thread for its sockets and a
//! [`dispatch`] loop that hands deliveries to user code on another thread.

pub mod client;
pub mod dispatch;
pub mod executor;
pub mod server;
