//! # framewire
//!
//! Framed, optionally TLS-secured TCP messaging.
//!
//! Every frame carries a typed id, a body length and a send timestamp,
//! followed by a body written with stack discipline: values pushed last are
//! popped first. A [`ServerInterface`] accepts many clients, a
//! [`ClientInterface`] owns one outgoing link, and both deliver incoming
//! messages to a user handler on a dedicated dispatch thread.
//!
//! ## Layers
//! - [`core`]: message layout, body serialization and the frame codec
//! - [`transport`]: connections, the TCP/TLS stream and TLS setup
//! - [`service`]: client and server façades with their dispatch loops
//! - [`utils`]: queues, completions, logging and metrics
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use framewire::{Connection, Message, RunPolicy, SendStrategy, ServerHandle, ServerInterface};
//!
//! let server = ServerInterface::<u32, _>::new(
//!     |server: &ServerHandle<u32>, msg: Message<u32>, origin: Option<Arc<Connection<u32>>>| {
//!         if let Some(client) = origin {
//!             // Echo every message back to its sender.
//!             drop(server.send(&client, msg, SendStrategy::Normal));
//!         }
//!     },
//! );
//!
//! server.start(60000).unwrap();
//! server.run(RunPolicy::Blocking).unwrap();
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::NetworkConfig;
pub use crate::core::codec::FrameCodec;
pub use crate::core::message::{ConnectionId, Message, MessageHeader, MessageId};
pub use crate::core::serialization::{CustomDecode, CustomEncode, Decode, Encode};
pub use crate::error::{Result, WireError};
pub use crate::service::client::{ClientHandler, ClientInterface};
pub use crate::service::dispatch::{Delivery, Inbox, RunPolicy};
pub use crate::service::server::{ConnectionRegistry, ServerHandle, ServerHandler, ServerInterface};
pub use crate::transport::connection::{Connection, ConnectionState, SendStrategy};
pub use crate::transport::tls::{TlsContext, TlsOptions, VerifyMode};
pub use crate::utils::completion::Completion;
pub use crate::utils::logging::init_logging;
pub use crate::utils::ts_queue::ThreadSafeQueue;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
