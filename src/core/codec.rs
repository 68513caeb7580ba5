//! # Frame Codec
//!
//! Tokio codec that turns a byte stream into [`Message`]s and back.
//!
//! A frame is a header immediately followed by `header.size` body bytes.
//! Decoding is a two-step read: once a full header is buffered it is parsed
//! and parked in the codec, then the body is awaited. A zero-length body
//! completes the frame straight away.
//!
//! ## Security
//! - Declared sizes above `max_payload` are rejected before any allocation
//! - Unknown ids fail the header parse

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::message::{Message, MessageHeader, MessageId};
use crate::error::{Result, WireError};

/// Header-then-body framing for one connection
#[derive(Debug)]
pub struct FrameCodec<T> {
    max_payload: usize,
    /// Header parsed off the wire whose body is still incomplete
    pending: Option<MessageHeader<T>>,
}

impl<T: MessageId> FrameCodec<T> {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            max_payload,
            pending: None,
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl<T: MessageId> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: MessageId> Decoder for FrameCodec<T> {
    type Item = Message<T>;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message<T>>> {
        let header = match self.pending.take() {
            Some(header) => header,
            None => {
                let header_len = MessageHeader::<T>::wire_len();
                if src.len() < header_len {
                    src.reserve(header_len - src.len());
                    return Ok(None);
                }

                let header = MessageHeader::<T>::from_bytes(&src[..header_len])?;
                if header.size() > self.max_payload as u64 {
                    return Err(WireError::OversizedFrame(header.size()));
                }
                src.advance(header_len);
                header
            }
        };

        let body_len = header.size() as usize;
        if src.len() < body_len {
            src.reserve(body_len - src.len());
            self.pending = Some(header);
            return Ok(None);
        }

        let body = src.split_to(body_len).to_vec();
        Ok(Some(Message::from_parts(header, body)))
    }
}

impl<T: MessageId> Encoder<Message<T>> for FrameCodec<T> {
    type Error = WireError;

    fn encode(&mut self, msg: Message<T>, dst: &mut BytesMut) -> Result<()> {
        if msg.size() > self.max_payload {
            return Err(WireError::OversizedFrame(msg.size() as u64));
        }

        dst.reserve(MessageHeader::<T>::wire_len() + msg.size());
        dst.extend_from_slice(&msg.header().to_bytes());
        dst.extend_from_slice(msg.body());
        Ok(())
    }
}
