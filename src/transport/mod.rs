//! # Transport Layer
//!
//! Connections and the byte streams under them.
//!
//! ## Components
//! - **Connection**: state machine plus driver task for one link
//! - **Stream**: plain TCP or TLS behind one `AsyncRead + AsyncWrite` type
//! - **TLS**: PEM loading, verification policy and rustls configs

pub mod connection;
pub mod stream;
pub mod tls;
