//! Bounds-checked little-endian reads and writes over byte buffers.
//!
//! Machine code, CIL bodies and signature blobs are all little-endian, so unlike a general
//! purpose binary reader this module only carries the little-endian half. The [`CodeIO`]
//! trait is implemented for every fixed-size integer the decoder and the CIL encoder touch.

use crate::{Error::OutOfBounds, Result};

/// Fixed-size integers that can be read from and written to little-endian byte buffers.
pub trait CodeIO: Sized + Copy {
    /// Byte array representation of this type.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Decode from little-endian bytes
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Encode to little-endian bytes
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_code_io {
    ($($ty:ty => $len:literal),* $(,)?) => {
        $(
            impl CodeIO for $ty {
                type Bytes = [u8; $len];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_code_io!(
    u8 => 1,
    i8 => 1,
    u16 => 2,
    i16 => 2,
    u32 => 4,
    i32 => 4,
    u64 => 8,
    i64 => 8,
);

/// Reads a `T` at `offset` and advances the offset past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if fewer than `size_of::<T>()` bytes remain.
pub fn read_le_at<T: CodeIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let end = offset.checked_add(type_len).ok_or(OutOfBounds)?;
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;
    Ok(T::from_le_bytes(read))
}

/// Writes `value` at `offset` and advances the offset past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too small.
pub fn write_le_at<T: CodeIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let bytes = value.to_le_bytes();
    let bytes = bytes.as_ref();
    let end = offset.checked_add(bytes.len()).ok_or(OutOfBounds)?;
    if end > data.len() {
        return Err(OutOfBounds);
    }

    data[*offset..end].copy_from_slice(bytes);
    *offset = end;
    Ok(())
}

/// Appends `value` in the compressed unsigned integer encoding of signature blobs
/// (ECMA-335 II.23.2): one byte up to `0x7F`, two up to `0x3FFF`, four up to `0x1FFF_FFFF`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] for values above `0x1FFF_FFFF`.
pub fn write_compressed_uint(value: u32, buffer: &mut Vec<u8>) -> Result<()> {
    match value {
        0..=0x7F => buffer.push(value as u8),
        0x80..=0x3FFF => buffer.extend_from_slice(&((value as u16) | 0x8000).to_be_bytes()),
        0x4000..=0x1FFF_FFFF => buffer.extend_from_slice(&(value | 0xC000_0000).to_be_bytes()),
        _ => return Err(OutOfBounds),
    }
    Ok(())
}
