//! Typed value encoding on top of [`Serialiser`].
//!
//! Scalars go on the wire as little-endian bytes of their natural width. Sequences carry a
//! count first: `u32` for strings, buffers and explicit arrays, `u64` for `Vec`/`VecDeque`.
//! Fixed-size arrays carry no count.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::mem::size_of;
use std::sync::Arc;

use bytemuck::Pod;

use crate::debug::Render;
use crate::error::SerialiserError;
use crate::serialiser::{Mode, Serialiser};

pub trait Encode {
    fn encode(&self, ser: &mut Serialiser, name: &str);
}

/// Decoding never fails outright: once the serialiser is in an error state implementations
/// return whatever default they can build.
pub trait Decode: Sized {
    /// Smallest possible encoding, used to reject implausible counts before allocating.
    const MIN_ENCODED_LEN: usize = 1;

    fn decode(ser: &mut Serialiser, name: &str) -> Self;
}

macro_rules! le_scalar {
    ($($t:ty),* $(,)?) => {
        $(
            impl Encode for $t {
                fn encode(&self, ser: &mut Serialiser, name: &str) {
                    ser.write_raw(&self.to_le_bytes());
                    ser.debug_value(name, self);
                }
            }

            impl Decode for $t {
                const MIN_ENCODED_LEN: usize = size_of::<$t>();

                fn decode(ser: &mut Serialiser, name: &str) -> Self {
                    let value = <$t>::from_le_bytes(ser.read_scalar_bytes());
                    ser.debug_value(name, &value);
                    value
                }
            }
        )*
    };
}

le_scalar!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl Encode for bool {
    fn encode(&self, ser: &mut Serialiser, name: &str) {
        ser.write_raw(&[u8::from(*self)]);
        ser.debug_value(name, self);
    }
}

impl Decode for bool {
    fn decode(ser: &mut Serialiser, name: &str) -> Self {
        let value = match ser.read_scalar_bytes::<1>()[0] {
            0 => false,
            1 => true,
            _ => {
                ser.fail(SerialiserError::Corrupt("invalid bool"));
                false
            }
        };
        ser.debug_value(name, &value);
        value
    }
}

impl Encode for str {
    fn encode(&self, ser: &mut Serialiser, name: &str) {
        if ser.write_count_u32(self.len()) {
            ser.write_raw(self.as_bytes());
        }
        ser.debug_value(name, self);
    }
}

impl Encode for String {
    fn encode(&self, ser: &mut Serialiser, name: &str) {
        self.as_str().encode(ser, name);
    }
}

impl Decode for String {
    const MIN_ENCODED_LEN: usize = 4;

    fn decode(ser: &mut Serialiser, name: &str) -> Self {
        let len = ser.read_count_u32(1);
        let bytes = ser.read_raw(len).map(<[u8]>::to_vec).unwrap_or_default();
        let value = match String::from_utf8(bytes) {
            Ok(value) => value,
            Err(err) => {
                ser.fail(err.into());
                String::new()
            }
        };
        ser.debug_value(name, &value);
        value
    }
}

impl<A: Encode, B: Encode> Encode for (A, B) {
    fn encode(&self, ser: &mut Serialiser, name: &str) {
        self.0.encode(ser, name);
        self.1.encode(ser, name);
    }
}

impl<A: Decode, B: Decode> Decode for (A, B) {
    const MIN_ENCODED_LEN: usize = A::MIN_ENCODED_LEN + B::MIN_ENCODED_LEN;

    fn decode(ser: &mut Serialiser, name: &str) -> Self {
        let a = A::decode(ser, name);
        let b = B::decode(ser, name);
        (a, b)
    }
}

impl<T: Encode, const N: usize> Encode for [T; N] {
    fn encode(&self, ser: &mut Serialiser, name: &str) {
        for (idx, elem) in self.iter().enumerate() {
            let elem_name = ser.element_name(name, idx);
            elem.encode(ser, &elem_name);
        }
    }
}

impl<T: Decode, const N: usize> Decode for [T; N] {
    const MIN_ENCODED_LEN: usize = N * T::MIN_ENCODED_LEN;

    fn decode(ser: &mut Serialiser, name: &str) -> Self {
        std::array::from_fn(|idx| {
            let elem_name = ser.element_name(name, idx);
            T::decode(ser, &elem_name)
        })
    }
}

/// Dynamic sequences carry a 64-bit count.
impl<T: Encode> Encode for [T] {
    fn encode(&self, ser: &mut Serialiser, name: &str) {
        if ser.write_count_u64(self.len()) {
            encode_elements(ser, name, self.iter());
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, ser: &mut Serialiser, name: &str) {
        self.as_slice().encode(ser, name);
    }
}

impl<T: Decode> Decode for Vec<T> {
    const MIN_ENCODED_LEN: usize = 8;

    fn decode(ser: &mut Serialiser, name: &str) -> Self {
        let count = ser.read_count_u64(T::MIN_ENCODED_LEN);
        decode_elements(ser, name, count)
    }
}

impl<T: Encode> Encode for VecDeque<T> {
    fn encode(&self, ser: &mut Serialiser, name: &str) {
        if ser.write_count_u64(self.len()) {
            encode_elements(ser, name, self.iter());
        }
    }
}

impl<T: Decode> Decode for VecDeque<T> {
    const MIN_ENCODED_LEN: usize = 8;

    fn decode(ser: &mut Serialiser, name: &str) -> Self {
        let count = ser.read_count_u64(T::MIN_ENCODED_LEN);
        decode_elements::<T>(ser, name, count).into()
    }
}

fn encode_elements<'a, T: Encode + 'a>(
    ser: &mut Serialiser,
    name: &str,
    elems: impl ExactSizeIterator<Item = &'a T>,
) {
    if elems.len() == 0 {
        ser.debug_line(|| format!("{name}[]"));
        return;
    }
    for (idx, elem) in elems.enumerate() {
        let elem_name = ser.element_name(name, idx);
        elem.encode(ser, &elem_name);
    }
}

fn decode_elements<T: Decode>(ser: &mut Serialiser, name: &str, count: usize) -> Vec<T> {
    if ser.has_error() {
        return Vec::new();
    }
    if count == 0 {
        ser.debug_line(|| format!("{name}[]"));
        return Vec::new();
    }
    let mut out = Vec::with_capacity(count);
    for idx in 0..count {
        let elem_name = ser.element_name(name, idx);
        out.push(T::decode(ser, &elem_name));
        if ser.has_error() {
            return Vec::new();
        }
    }
    out
}

impl Serialiser {
    /// Encodes `value`; panics in read mode.
    pub fn write<T: Encode + ?Sized>(&mut self, name: &str, value: &T) {
        value.encode(self, name);
    }

    pub fn read<T: Decode>(&mut self, name: &str) -> T {
        T::decode(self, name)
    }

    /// Encodes `value` when writing; replaces it with the decoded value when reading.
    pub fn serialise<T: Encode + Decode>(&mut self, name: &str, value: &mut T) {
        match self.mode() {
            Mode::Writing => value.encode(self, name),
            Mode::Reading => *value = T::decode(self, name),
        }
    }

    /// Counted array of plain-old-data elements, copied as one block.
    pub fn write_pod_array<T: Pod + Debug>(&mut self, name: &str, elems: &[T]) {
        if !self.write_count_u32(elems.len()) {
            return;
        }
        if size_of::<T>() > 0 {
            self.write_raw(bytemuck::cast_slice(elems));
        }
        self.debug_pod_elements(name, elems);
    }

    pub fn read_pod_array<T: Pod + Debug>(&mut self, name: &str) -> Vec<T> {
        let count = self.read_count_u32(size_of::<T>());
        if self.has_error() {
            return Vec::new();
        }
        let mut out = vec![T::zeroed(); count];
        if size_of::<T>() > 0 && count > 0 {
            match self.read_raw(count * size_of::<T>()) {
                Some(bytes) => bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(bytes),
                None => return Vec::new(),
            }
        }
        self.debug_pod_elements(name, &out);
        out
    }

    pub fn serialise_pod_array<T: Pod + Debug>(&mut self, name: &str, elems: &mut Vec<T>) {
        match self.mode() {
            Mode::Writing => self.write_pod_array(name, elems),
            Mode::Reading => *elems = self.read_pod_array(name),
        }
    }

    /// Counted array whose elements each go through their own codec.
    pub fn write_complex_array<T: Encode>(&mut self, name: &str, elems: &[T]) {
        if self.write_count_u32(elems.len()) {
            encode_elements(self, name, elems.iter());
        }
    }

    pub fn read_complex_array<T: Decode>(&mut self, name: &str) -> Vec<T> {
        let count = self.read_count_u32(T::MIN_ENCODED_LEN);
        decode_elements(self, name, count)
    }

    pub fn serialise_complex_array<T: Encode + Decode>(&mut self, name: &str, elems: &mut Vec<T>) {
        match self.mode() {
            Mode::Writing => self.write_complex_array(name, elems),
            Mode::Reading => *elems = self.read_complex_array(name),
        }
    }

    /// Decodes a string and returns the shared interned copy.
    pub fn read_interned_str(&mut self, name: &str) -> Arc<str> {
        let text = String::decode(self, name);
        self.intern(text)
    }

    fn debug_pod_elements<T: Debug>(&mut self, name: &str, elems: &[T]) {
        if !self.debug_text_enabled() {
            return;
        }
        if elems.is_empty() {
            self.debug_line(|| format!("{name}[]"));
        }
        for (idx, elem) in elems.iter().enumerate() {
            self.debug_line(|| format!("{name}[{idx}]: {elem:?}"));
        }
    }
}
