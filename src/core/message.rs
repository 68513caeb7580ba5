//! # Messages
//!
//! A [`Message`] is a typed header plus a byte body used as a stack.
//!
//! ## Header wire format (little-endian)
//! ```text
//! [Id(sizeof Repr)] [Size(8)] [Timestamp(8)]
//! ```
//! `Size` always equals the body length. It is refreshed after every push
//! and pop, so a header read off the wire tells the reader exactly how many
//! body bytes follow.
//!
//! ## Message ids
//! The id type is any [`MessageId`]: the unsigned integers work directly and
//! [`define_message_ids!`](crate::define_message_ids) generates an enum with a
//! fixed integer representation.
//!
//! ## Usage
//! ```rust
//! use framewire::Message;
//!
//! let mut msg = Message::<u32>::new(7);
//! msg.push(&42u32).push(&43u32).push(&44u32);
//! assert_eq!(msg.size(), 12);
//!
//! let c: u32 = msg.pop().unwrap();
//! let b: u32 = msg.pop().unwrap();
//! let a: u32 = msg.pop().unwrap();
//! assert_eq!((a, b, c), (42, 43, 44));
//! assert!(msg.is_empty());
//! ```

use std::fmt::{self, Debug, Display};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::serialization::{Decode, Encode, Scalar};
use crate::error::{Result, WireError};

/// Integer-backed message identifier.
pub trait MessageId: Copy + Default + PartialEq + Debug + Send + Sync + 'static {
    /// Integer written on the wire
    type Repr: Scalar + Into<u64>;

    fn to_repr(self) -> Self::Repr;

    /// `None` for integers that name no known id.
    fn from_repr(repr: Self::Repr) -> Option<Self>;
}

macro_rules! impl_integer_id {
    ($($t:ty),*) => {
        $(
            impl MessageId for $t {
                type Repr = $t;

                #[inline]
                fn to_repr(self) -> $t {
                    self
                }

                #[inline]
                fn from_repr(repr: $t) -> Option<Self> {
                    Some(repr)
                }
            }
        )*
    };
}

impl_integer_id!(u8, u16, u32, u64);

/// Declare a message id enum with a fixed integer representation.
///
/// The first variant becomes the `Default`. Every variant needs an explicit
/// discriminant.
///
/// ```rust
/// use framewire::core::message::MessageId;
/// use framewire::define_message_ids;
///
/// define_message_ids! {
///     pub enum ChatId: u16 {
///         Hello = 1,
///         Text = 2,
///         Bye = 9,
///     }
/// }
///
/// assert_eq!(ChatId::Bye.to_repr(), 9);
/// assert_eq!(ChatId::from_repr(2), Some(ChatId::Text));
/// assert_eq!(ChatId::from_repr(3), None);
/// assert_eq!(ChatId::default(), ChatId::Hello);
/// ```
#[macro_export]
macro_rules! define_message_ids {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident : $repr:ident {
            $first:ident = $first_value:expr
            $(, $variant:ident = $value:expr)* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[repr($repr)]
        $vis enum $name {
            #[default]
            $first = $first_value,
            $($variant = $value,)*
        }

        impl $crate::core::message::MessageId for $name {
            type Repr = $repr;

            fn to_repr(self) -> $repr {
                self as $repr
            }

            fn from_repr(repr: $repr) -> ::std::option::Option<Self> {
                if repr == $name::$first as $repr {
                    return ::std::option::Option::Some($name::$first);
                }
                $(
                    if repr == $name::$variant as $repr {
                        return ::std::option::Option::Some($name::$variant);
                    }
                )*
                ::std::option::Option::None
            }
        }
    };
}

/// Stable handle naming the connection a message arrived on.
///
/// Ids are unique for the life of the process and never reused, so a stale
/// id simply fails to resolve once its connection is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Fixed-size message header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader<T> {
    id: T,
    size: u64,
    timestamp: u64,
}

impl<T: MessageId> MessageHeader<T> {
    pub fn new(id: T) -> Self {
        Self {
            id,
            size: 0,
            timestamp: 0,
        }
    }

    /// Encoded header length for this id type.
    pub fn wire_len() -> usize {
        T::Repr::SIZE + 16
    }

    pub fn id(&self) -> T {
        self.id
    }

    /// Declared body length
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Milliseconds since the UNIX epoch, 0 when unset
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::wire_len());
        self.id.to_repr().put(&mut out);
        self.size.put(&mut out);
        self.timestamp.put(&mut out);
        out
    }

    /// Parse a header from at least [`wire_len`](Self::wire_len) bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let id_len = T::Repr::SIZE;
        if bytes.len() < Self::wire_len() {
            return Err(WireError::BodyUnderflow {
                needed: Self::wire_len(),
                available: bytes.len(),
            });
        }

        let repr = T::Repr::take(&bytes[..id_len]);
        let id = T::from_repr(repr).ok_or_else(|| WireError::InvalidMessageId(repr.into()))?;
        let size = u64::take(&bytes[id_len..id_len + 8]);
        let timestamp = u64::take(&bytes[id_len + 8..id_len + 16]);

        Ok(Self {
            id,
            size,
            timestamp,
        })
    }
}

/// A header plus a stack-discipline body.
///
/// `origin` names the connection a received message arrived on and is
/// `None` for locally built messages. It never travels on the wire.
#[derive(Clone, PartialEq, Default)]
pub struct Message<T> {
    header: MessageHeader<T>,
    body: Vec<u8>,
    origin: Option<ConnectionId>,
}

impl<T: MessageId> Message<T> {
    /// Empty message with a zero timestamp.
    pub fn new(id: T) -> Self {
        Self {
            header: MessageHeader::new(id),
            body: Vec::new(),
            origin: None,
        }
    }

    pub(crate) fn from_parts(header: MessageHeader<T>, body: Vec<u8>) -> Self {
        let mut msg = Self {
            header,
            body,
            origin: None,
        };
        msg.sync_size();
        msg
    }

    /// Message id from the header
    pub fn id(&self) -> T {
        self.header.id
    }

    /// Change the id; the body is untouched.
    pub fn set_id(&mut self, id: T) {
        self.header.id = id;
    }

    /// Header as it goes on the wire
    pub fn header(&self) -> &MessageHeader<T> {
        &self.header
    }

    /// Raw body bytes, oldest push first
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body length in bytes
    pub fn size(&self) -> usize {
        self.body.len()
    }

    /// True once every pushed value has been popped
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Milliseconds since the Unix epoch, stamped when queued for sending
    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    /// Override the timestamp; a non-zero value is kept on send.
    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.header.timestamp = timestamp;
    }

    /// Connection a received message arrived on
    pub fn origin(&self) -> Option<ConnectionId> {
        self.origin
    }

    pub(crate) fn set_origin(&mut self, origin: ConnectionId) {
        self.origin = Some(origin);
    }

    #[inline]
    fn sync_size(&mut self) {
        self.header.size = self.body.len() as u64;
    }

    /// Append `value` to the body.
    pub fn push<V: Encode + ?Sized>(&mut self, value: &V) -> &mut Self {
        value.encode(&mut self.body);
        self.sync_size();
        self
    }

    /// Builder form of [`push`](Self::push).
    pub fn with<V: Encode + ?Sized>(mut self, value: &V) -> Self {
        self.push(value);
        self
    }

    /// Remove the most recently pushed value of type `V`.
    ///
    /// On error the body may be partially consumed.
    pub fn pop<V: Decode>(&mut self) -> Result<V> {
        let value = V::decode(&mut self.body);
        self.sync_size();
        value
    }

    /// Pop into an existing slot, chainable with `?`.
    pub fn pop_into<V: Decode>(&mut self, slot: &mut V) -> Result<&mut Self> {
        *slot = self.pop()?;
        Ok(self)
    }

    /// Return to the default state: default id, no origin, zero timestamp
    /// and an empty body. The body allocation is kept for reuse.
    pub fn reset(&mut self) {
        self.header = MessageHeader::default();
        self.body.clear();
        self.origin = None;
    }
}

impl<T: Debug> Debug for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.header.id)
            .field("size", &self.header.size)
            .field("timestamp", &self.header.timestamp)
            .field("origin", &self.origin)
            .finish()
    }
}

impl<T: Debug> Display for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID: {:?} Size: {}", self.header.id, self.header.size)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    crate::define_message_ids! {
        enum TestId: u8 {
            Ping = 3,
            Pong = 4,
        }
    }

    #[test]
    fn test_header_round_trip() {
        let mut msg = Message::new(TestId::Pong);
        msg.push(&1u64);
        msg.set_timestamp(99);

        let bytes = msg.header().to_bytes();
        assert_eq!(bytes.len(), MessageHeader::<TestId>::wire_len());
        assert_eq!(bytes[0], 4);

        let header = MessageHeader::<TestId>::from_bytes(&bytes).unwrap();
        assert_eq!(header.id(), TestId::Pong);
        assert_eq!(header.size(), 8);
        assert_eq!(header.timestamp(), 99);
    }

    #[test]
    fn test_unknown_id_rejected() {
        let mut bytes = MessageHeader::new(TestId::Ping).to_bytes();
        bytes[0] = 200;
        assert!(matches!(
            MessageHeader::<TestId>::from_bytes(&bytes),
            Err(WireError::InvalidMessageId(200))
        ));
    }

    #[test]
    fn test_size_tracks_body() {
        let mut msg = Message::new(1u16);
        msg.push(&7u8).push("abc");
        assert_eq!(msg.header().size(), msg.size() as u64);

        let _: String = msg.pop().unwrap();
        assert_eq!(msg.header().size(), 1);

        msg.reset();
        assert_eq!(msg.header().size(), 0);
        assert!(msg.is_empty());
    }

    #[test]
    fn test_pop_into_chain() {
        let mut msg = Message::new(0u32).with(&1u8).with(&2u16);
        let (mut a, mut b) = (0u8, 0u16);
        msg.pop_into(&mut b).unwrap().pop_into(&mut a).unwrap();
        assert_eq!((a, b), (1, 2));
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }
}
