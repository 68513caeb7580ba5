//! # Core Message Components
//!
//! Message layout, body serialization and stream framing.
//!
//! ## Components
//! - **Message**: typed header plus stack-discipline body
//! - **Serialization**: scalar, sequence and custom-codec body encoding
//! - **Codec**: Tokio codec for framing over byte streams
//!
//! ## Wire Format
//! ```text
//! [Id(sizeof Repr)] [Size(8)] [Timestamp(8)] [Body(Size)]
//! ```
//! All integers are little-endian. There is no magic or version byte.
//!
//! ## Security
//! - Length validation before allocation
//! - Unknown message ids are rejected at the header

pub mod codec;
pub mod message;
pub mod serialization;
