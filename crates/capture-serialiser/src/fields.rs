//! Declarative field helpers: one call site that writes when encoding and yields the decoded
//! value when reading.

use std::ops::{Deref, DerefMut};

use crate::codec::{Decode, Encode};
use crate::serialiser::{Mode, Serialiser};

/// How a single named field is serialised.
///
/// ```
/// use capture_serialiser::{Field, Serialiser};
///
/// let mut ser = Serialiser::new_writer();
/// let has_extra = true;
/// let width: u32 = Field::new("width").value(&mut ser, || 640);
/// let extra: u16 = Field::new("extra").present_if(has_extra).value(&mut ser, || 3);
/// assert_eq!((width, extra), (640, 3));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Field<'n> {
    name: &'n str,
    present: bool,
    count: Option<usize>,
    align: Option<usize>,
}

impl<'n> Field<'n> {
    pub fn new(name: &'n str) -> Self {
        Self {
            name,
            present: true,
            count: None,
            align: None,
        }
    }

    /// Absent fields take no bytes and read back as their default. The condition must evaluate
    /// the same way on both sides.
    pub fn present_if(mut self, present: bool) -> Self {
        self.present = present;
        self
    }

    /// Element count for [`Field::elements`], known to both sides out of band.
    pub fn count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Alignment for [`Field::buffer`] bytes.
    pub fn aligned(mut self, alignment: usize) -> Self {
        self.align = Some(alignment);
        self
    }

    pub fn name(&self) -> &'n str {
        self.name
    }

    /// A single value. `input` is only evaluated when writing.
    pub fn value<T: Encode + Decode + Default>(
        &self,
        ser: &mut Serialiser,
        input: impl FnOnce() -> T,
    ) -> T {
        if !self.present {
            return T::default();
        }
        match ser.mode() {
            Mode::Writing => {
                let value = input();
                value.encode(ser, self.name);
                value
            }
            Mode::Reading => T::decode(ser, self.name),
        }
    }

    /// The value behind an optional reference; a missing value is written as its default.
    pub fn pointee<T: Encode + Decode + Default + Clone>(
        &self,
        ser: &mut Serialiser,
        input: Option<&T>,
    ) -> T {
        self.value(ser, || input.cloned().unwrap_or_default())
    }

    /// Exactly [`Field::count`] elements with no count on the wire.
    ///
    /// # Panics
    ///
    /// Panics when writing fewer than `count` elements.
    pub fn elements<T: Encode + Decode + Clone>(&self, ser: &mut Serialiser, input: &[T]) -> Vec<T> {
        if !self.present {
            return Vec::new();
        }
        let count = self.count.unwrap_or(input.len());
        match ser.mode() {
            Mode::Writing => {
                assert!(
                    input.len() >= count,
                    "field {} has {} elements, expected {count}",
                    self.name,
                    input.len()
                );
                for (idx, elem) in input[..count].iter().enumerate() {
                    let elem_name = ser.element_name(self.name, idx);
                    elem.encode(ser, &elem_name);
                }
                input[..count].to_vec()
            }
            Mode::Reading => {
                let mut out = Vec::new();
                for idx in 0..count {
                    let elem_name = ser.element_name(self.name, idx);
                    let elem = T::decode(ser, &elem_name);
                    if ser.has_error() {
                        return Vec::new();
                    }
                    out.push(elem);
                }
                out
            }
        }
    }

    /// A length-prefixed byte buffer, aligned if configured.
    pub fn buffer(&self, ser: &mut Serialiser, input: &[u8]) -> Vec<u8> {
        if !self.present {
            return Vec::new();
        }
        if let Some(alignment) = self.align {
            ser.align_next_buffer(alignment);
        }
        match ser.mode() {
            Mode::Writing => {
                ser.write_buffer(self.name, input);
                input.to_vec()
            }
            Mode::Reading => ser.read_buffer(self.name),
        }
    }
}

type Release<T> = Box<dyn FnOnce(&mut T) + Send>;

/// A value produced by one serialise call, carrying an optional cleanup that runs when a
/// decoded value is dropped. Written values are owned by the caller and never released here.
pub struct Decoded<T> {
    value: Option<T>,
    mode: Mode,
    release: Option<Release<T>>,
}

impl<T: Encode + Decode> Decoded<T> {
    /// Serialises a value. `input` is only evaluated when writing.
    pub fn serialise(ser: &mut Serialiser, name: &str, input: impl FnOnce() -> T) -> Self {
        Self::serialise_with(ser, name, input, |_| {}, |_, _| {})
    }

    /// Like [`Decoded::serialise`], running `before` ahead of the value's bytes and `after` once
    /// the value exists on both sides.
    pub fn serialise_with(
        ser: &mut Serialiser,
        name: &str,
        input: impl FnOnce() -> T,
        before: impl FnOnce(&mut Serialiser),
        after: impl FnOnce(&mut Serialiser, &mut T),
    ) -> Self {
        before(ser);
        let mode = ser.mode();
        let mut value = match mode {
            Mode::Writing => {
                let value = input();
                value.encode(ser, name);
                value
            }
            Mode::Reading => T::decode(ser, name),
        };
        after(ser, &mut value);
        Self {
            value: Some(value),
            mode,
            release: None,
        }
    }
}

impl<T> Decoded<T> {
    /// Installs cleanup for a decoded value. Ignored for written values.
    pub fn on_release(mut self, release: impl FnOnce(&mut T) + Send + 'static) -> Self {
        if self.mode == Mode::Reading {
            self.release = Some(Box::new(release));
        }
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Takes the value out without running any cleanup.
    pub fn into_inner(mut self) -> T {
        self.release = None;
        match self.value.take() {
            Some(value) => value,
            None => unreachable!("Decoded always holds a value until dropped"),
        }
    }
}

impl<T> Deref for Decoded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => unreachable!("Decoded always holds a value until dropped"),
        }
    }
}

impl<T> DerefMut for Decoded<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("Decoded always holds a value until dropped"),
        }
    }
}

impl<T> Drop for Decoded<T> {
    fn drop(&mut self) {
        if let (Some(release), Some(value)) = (self.release.take(), self.value.as_mut()) {
            release(value);
        }
    }
}
