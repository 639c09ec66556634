//! Little-endian codec for fixed-width integers.
//!
//! [`LittleBuffer`] is a typed window over the little-endian byte image of an
//! unsigned integer. Construction from a value stores the bytes in wire
//! order regardless of host endianness; construction from a byte slice copies
//! the window at an offset. Every record on the wire and in the shared rings
//! is built from these windows.

use crate::error::{BusError, BusResult};

mod sealed {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

/// Unsigned integer types with a little-endian byte image.
pub trait LittleEndianValue: sealed::Sealed + Copy {
    /// Fixed-size byte array holding the wire image.
    type Bytes: AsRef<[u8]> + AsMut<[u8]> + Default + Copy;

    /// Width of the wire image in bytes.
    const SIZE: usize;

    fn to_le_image(self) -> Self::Bytes;
    fn from_le_image(bytes: Self::Bytes) -> Self;
}

macro_rules! impl_little_endian_value {
    ($($ty:ty => $size:expr),* $(,)?) => {
        $(
            impl LittleEndianValue for $ty {
                type Bytes = [u8; $size];
                const SIZE: usize = $size;

                fn to_le_image(self) -> Self::Bytes {
                    self.to_le_bytes()
                }

                fn from_le_image(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }
            }
        )*
    };
}

impl_little_endian_value!(u8 => 1, u16 => 2, u32 => 4, u64 => 8);

/// Fixed-width little-endian window over the bytes of an integer.
#[derive(Debug, Clone, Copy)]
pub struct LittleBuffer<T: LittleEndianValue> {
    bytes: T::Bytes,
}

impl<T: LittleEndianValue> LittleBuffer<T> {
    /// Number of bytes in the window.
    pub const LEN: usize = T::SIZE;

    /// Create a window holding the little-endian image of `value`.
    pub fn new(value: T) -> Self {
        Self {
            bytes: value.to_le_image(),
        }
    }

    /// Copy a window out of `buffer` starting at `offset`.
    pub fn from_slice(buffer: &[u8], offset: usize) -> BusResult<Self> {
        let end = offset
            .checked_add(T::SIZE)
            .ok_or_else(|| BusError::Decode("window offset overflow".to_string()))?;
        let window = buffer.get(offset..end).ok_or_else(|| {
            BusError::Decode(format!(
                "window {offset}..{end} out of bounds for buffer of {} bytes",
                buffer.len()
            ))
        })?;

        let mut bytes = T::Bytes::default();
        bytes.as_mut().copy_from_slice(window);
        Ok(Self { bytes })
    }

    /// Reconstruct the integer from the window.
    pub fn value(&self) -> T {
        T::from_le_image(self.bytes)
    }

    /// Raw little-endian bytes of the window.
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_ref()
    }

    /// Write the window into `dest` at `offset`.
    pub fn write_into(&self, dest: &mut [u8], offset: usize) -> BusResult<()> {
        let end = offset
            .checked_add(T::SIZE)
            .ok_or_else(|| BusError::Encode("window offset overflow".to_string()))?;
        let dest_len = dest.len();
        let window = dest.get_mut(offset..end).ok_or_else(|| {
            BusError::Encode(format!(
                "window {offset}..{end} out of bounds for buffer of {dest_len} bytes"
            ))
        })?;
        window.copy_from_slice(self.bytes.as_ref());
        Ok(())
    }
}
