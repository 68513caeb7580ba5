//! # Stack-Discipline Serialization
//!
//! Payload bodies behave like a byte stack: every write appends to the end of
//! the body and every read removes from the end. Values therefore come back
//! in the reverse order they were pushed.
//!
//! ## Wire kinds
//! - **FixedScalar**: integers, floats and `bool`, written as their
//!   little-endian bytes
//! - **Sequence**: `Vec<T>`, `VecDeque<T>`, `[T; N]`, `String`. Elements are
//!   pushed in forward order, then the element count as `u64`. Reading pops
//!   the count, pops that many elements, then reverses them back into order.
//! - **CustomCodec**: types that turn themselves into a byte vector. The bytes
//!   travel as a `Vec<u8>` sequence. See [`custom_codec!`](crate::custom_codec).
//!
//! There is no framing or type tag inside a body. Reader and writer agree on
//! the layout out of band.
//!
//! ## Usage
//! ```rust
//! use framewire::core::serialization::{Decode, Encode};
//!
//! let mut body = Vec::new();
//! 7u16.encode(&mut body);
//! vec![1u8, 2, 3].encode(&mut body);
//!
//! let items: Vec<u8> = Vec::decode(&mut body).unwrap();
//! let tail = u16::decode(&mut body).unwrap();
//! assert_eq!(items, vec![1, 2, 3]);
//! assert_eq!(tail, 7);
//! assert!(body.is_empty());
//! ```

use std::collections::VecDeque;

use crate::error::{Result, WireError};

/// How a type is laid out inside a body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    FixedScalar,
    Sequence,
    CustomCodec,
}

/// Append a value to the end of a body.
pub trait Encode {
    const KIND: WireKind;

    fn encode(&self, body: &mut Vec<u8>);
}

/// Remove a value from the end of a body.
pub trait Decode: Sized {
    const KIND: WireKind;

    fn decode(body: &mut Vec<u8>) -> Result<Self>;
}

/// Fixed-width plain value with a little-endian byte form.
pub trait Scalar: Copy + Default + Send + Sync + 'static {
    /// Encoded width in bytes
    const SIZE: usize;

    fn put(self, out: &mut Vec<u8>);

    /// Rebuild from exactly `SIZE` bytes.
    fn take(bytes: &[u8]) -> Self;
}

/// Pop one scalar off the end of `body`.
fn pop_scalar<S: Scalar>(body: &mut Vec<u8>) -> Result<S> {
    let available = body.len();
    if available < S::SIZE {
        return Err(WireError::BodyUnderflow {
            needed: S::SIZE,
            available,
        });
    }
    let start = available - S::SIZE;
    let value = S::take(&body[start..]);
    body.truncate(start);
    Ok(value)
}

macro_rules! impl_scalar {
    ($($t:ty),* $(,)?) => {
        $(
            impl Scalar for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                #[inline]
                fn put(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn take(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(bytes);
                    <$t>::from_le_bytes(raw)
                }
            }

            impl Encode for $t {
                const KIND: WireKind = WireKind::FixedScalar;

                #[inline]
                fn encode(&self, body: &mut Vec<u8>) {
                    self.put(body);
                }
            }

            impl Decode for $t {
                const KIND: WireKind = WireKind::FixedScalar;

                #[inline]
                fn decode(body: &mut Vec<u8>) -> Result<Self> {
                    pop_scalar(body)
                }
            }
        )*
    };
}

impl_scalar!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);

impl Scalar for bool {
    const SIZE: usize = 1;

    fn put(self, out: &mut Vec<u8>) {
        out.push(u8::from(self));
    }

    fn take(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

impl Encode for bool {
    const KIND: WireKind = WireKind::FixedScalar;

    fn encode(&self, body: &mut Vec<u8>) {
        self.put(body);
    }
}

impl Decode for bool {
    const KIND: WireKind = WireKind::FixedScalar;

    fn decode(body: &mut Vec<u8>) -> Result<Self> {
        pop_scalar(body)
    }
}

fn encode_items<'a, T, I>(items: I, count: usize, body: &mut Vec<u8>)
where
    T: Encode + 'a,
    I: IntoIterator<Item = &'a T>,
{
    for item in items {
        item.encode(body);
    }
    (count as u64).encode(body);
}

fn decode_items<T: Decode>(body: &mut Vec<u8>) -> Result<Vec<T>> {
    let count = u64::decode(body)?;
    // Every encoded element occupies at least one byte, so a larger count
    // cannot be satisfied and must not drive the allocation below.
    if count > body.len() as u64 {
        return Err(WireError::BodyUnderflow {
            needed: usize::try_from(count).unwrap_or(usize::MAX),
            available: body.len(),
        });
    }

    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        items.push(T::decode(body)?);
    }
    items.reverse();
    Ok(items)
}

impl<T: Encode> Encode for [T] {
    const KIND: WireKind = WireKind::Sequence;

    fn encode(&self, body: &mut Vec<u8>) {
        encode_items(self, self.len(), body);
    }
}

impl<T: Encode> Encode for Vec<T> {
    const KIND: WireKind = WireKind::Sequence;

    fn encode(&self, body: &mut Vec<u8>) {
        self.as_slice().encode(body);
    }
}

impl<T: Decode> Decode for Vec<T> {
    const KIND: WireKind = WireKind::Sequence;

    fn decode(body: &mut Vec<u8>) -> Result<Self> {
        decode_items(body)
    }
}

impl<T: Encode> Encode for VecDeque<T> {
    const KIND: WireKind = WireKind::Sequence;

    fn encode(&self, body: &mut Vec<u8>) {
        encode_items(self, self.len(), body);
    }
}

impl<T: Decode> Decode for VecDeque<T> {
    const KIND: WireKind = WireKind::Sequence;

    fn decode(body: &mut Vec<u8>) -> Result<Self> {
        decode_items(body).map(VecDeque::from)
    }
}

impl<T: Encode, const N: usize> Encode for [T; N] {
    const KIND: WireKind = WireKind::Sequence;

    fn encode(&self, body: &mut Vec<u8>) {
        self.as_slice().encode(body);
    }
}

impl<T: Decode, const N: usize> Decode for [T; N] {
    const KIND: WireKind = WireKind::Sequence;

    fn decode(body: &mut Vec<u8>) -> Result<Self> {
        let items: Vec<T> = decode_items(body)?;
        let found = items.len();
        items.try_into().map_err(|_| {
            WireError::Decode(format!("expected an array of {N} elements, found {found}"))
        })
    }
}

impl Encode for str {
    const KIND: WireKind = WireKind::Sequence;

    fn encode(&self, body: &mut Vec<u8>) {
        self.as_bytes().encode(body);
    }
}

impl Encode for String {
    const KIND: WireKind = WireKind::Sequence;

    fn encode(&self, body: &mut Vec<u8>) {
        self.as_str().encode(body);
    }
}

impl Decode for String {
    const KIND: WireKind = WireKind::Sequence;

    fn decode(body: &mut Vec<u8>) -> Result<Self> {
        let bytes: Vec<u8> = decode_items(body)?;
        String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)
    }
}

/// Types that serialize themselves to an opaque byte vector.
pub trait CustomEncode {
    fn wire_serialize(&self) -> Vec<u8>;
}

/// Types that rebuild themselves from the bytes produced by [`CustomEncode`].
pub trait CustomDecode: Sized {
    fn wire_deserialize(bytes: Vec<u8>) -> Result<Self>;
}

/// Push the custom byte form of `value` as a byte sequence.
pub fn encode_custom<C: CustomEncode + ?Sized>(value: &C, body: &mut Vec<u8>) {
    value.wire_serialize().encode(body);
}

/// Pop a byte sequence and hand it to `C::wire_deserialize`.
pub fn decode_custom<C: CustomDecode>(body: &mut Vec<u8>) -> Result<C> {
    let bytes: Vec<u8> = decode_items(body)?;
    C::wire_deserialize(bytes)
}

/// Wire a [`CustomEncode`] / [`CustomDecode`] type into the body codec.
///
/// `custom_codec!(encode T)` and `custom_codec!(decode T)` implement one
/// direction only; `custom_codec!(T)` implements both.
///
/// ```rust
/// use framewire::core::serialization::{CustomDecode, CustomEncode};
/// use framewire::{custom_codec, Message, Result};
///
/// #[derive(Debug, PartialEq)]
/// struct Point { x: i16, y: i16 }
///
/// impl CustomEncode for Point {
///     fn wire_serialize(&self) -> Vec<u8> {
///         [self.x.to_le_bytes(), self.y.to_le_bytes()].concat()
///     }
/// }
///
/// impl CustomDecode for Point {
///     fn wire_deserialize(bytes: Vec<u8>) -> Result<Self> {
///         Ok(Point {
///             x: i16::from_le_bytes([bytes[0], bytes[1]]),
///             y: i16::from_le_bytes([bytes[2], bytes[3]]),
///         })
///     }
/// }
///
/// custom_codec!(Point);
///
/// let mut msg = Message::<u8>::new(0);
/// msg.push(&Point { x: 3, y: -4 });
/// assert_eq!(msg.pop::<Point>().unwrap(), Point { x: 3, y: -4 });
/// ```
#[macro_export]
macro_rules! custom_codec {
    (encode $ty:ty) => {
        impl $crate::core::serialization::Encode for $ty {
            const KIND: $crate::core::serialization::WireKind =
                $crate::core::serialization::WireKind::CustomCodec;

            fn encode(&self, body: &mut ::std::vec::Vec<u8>) {
                $crate::core::serialization::encode_custom(self, body)
            }
        }
    };
    (decode $ty:ty) => {
        impl $crate::core::serialization::Decode for $ty {
            const KIND: $crate::core::serialization::WireKind =
                $crate::core::serialization::WireKind::CustomCodec;

            fn decode(body: &mut ::std::vec::Vec<u8>) -> $crate::error::Result<Self> {
                $crate::core::serialization::decode_custom(body)
            }
        }
    };
    ($ty:ty) => {
        $crate::custom_codec!(encode $ty);
        $crate::custom_codec!(decode $ty);
    };
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_scalars_are_little_endian() {
        let mut body = Vec::new();
        0x0102_0304u32.encode(&mut body);
        assert_eq!(body, vec![0x04, 0x03, 0x02, 0x01]);
        assert_eq!(u32::decode(&mut body).unwrap(), 0x0102_0304);
        assert!(body.is_empty());
    }

    #[test]
    fn test_scalar_underflow_leaves_body_untouched() {
        let mut body = vec![1u8, 2, 3];
        let err = u32::decode(&mut body).unwrap_err();
        assert!(matches!(
            err,
            WireError::BodyUnderflow {
                needed: 4,
                available: 3
            }
        ));
        assert_eq!(body, vec![1, 2, 3]);
    }

    #[test]
    fn test_sequence_layout_count_last() {
        let mut body = Vec::new();
        vec![10u8, 20, 30].encode(&mut body);
        assert_eq!(&body[..3], &[10, 20, 30]);
        assert_eq!(&body[3..], &3u64.to_le_bytes());
    }

    #[test]
    fn test_bogus_count_rejected_without_allocating() {
        let mut body = Vec::new();
        u64::MAX.encode(&mut body);
        assert!(matches!(
            Vec::<u8>::decode(&mut body),
            Err(WireError::BodyUnderflow { .. })
        ));
    }

    #[test]
    fn test_nested_sequences() {
        let nested = vec![vec![1u16, 2], vec![], vec![3]];
        let mut body = Vec::new();
        nested.encode(&mut body);
        let back: Vec<Vec<u16>> = Vec::decode(&mut body).unwrap();
        assert_eq!(back, nested);
        assert!(body.is_empty());
    }

    #[test]
    fn test_array_length_mismatch() {
        let mut body = Vec::new();
        vec![1u8, 2, 3].encode(&mut body);
        assert!(matches!(
            <[u8; 4]>::decode(&mut body),
            Err(WireError::Decode(_))
        ));
    }

    #[test]
    fn test_string_and_bool() {
        let mut body = Vec::new();
        true.encode(&mut body);
        "héllo".encode(&mut body);
        assert_eq!(String::decode(&mut body).unwrap(), "héllo");
        assert!(bool::decode(&mut body).unwrap());
    }

    #[test]
    fn test_invalid_utf8() {
        let mut body = Vec::new();
        vec![0xffu8, 0xfe].encode(&mut body);
        assert!(matches!(String::decode(&mut body), Err(WireError::InvalidUtf8)));
    }

    #[test]
    fn test_wire_kind_tags() {
        assert_eq!(<u64 as Encode>::KIND, WireKind::FixedScalar);
        assert_eq!(<Vec<u8> as Encode>::KIND, WireKind::Sequence);
        assert_eq!(<String as Decode>::KIND, WireKind::Sequence);
        assert_eq!(<[f32; 2] as Decode>::KIND, WireKind::Sequence);
    }
}
