//! Low-level little-endian reading and writing utilities for PE structures.
//!
//! Every multi-byte field of the PE/COFF format is stored little-endian. This module provides
//! the bounds-checked primitives the schema engine and the table decoders build on:
//!
//! - [`crate::file::io::read_le`] / [`crate::file::io::read_le_at`] - typed reads with
//!   optional offset tracking
//! - [`crate::file::io::write_le_at`] - typed writes with offset tracking
//! - [`crate::file::io::read_uint`] / [`crate::file::io::write_uint`] - reads and writes of
//!   unsigned integers whose width (1, 2, 4 or 8 bytes) is only known at runtime
//! - [`crate::file::io::read_cstr`] - bounded NUL-terminated string reads
//!
//! # Error Handling
//!
//! All functions return [`crate::Error::OutOfBounds`] if the buffer does not hold enough
//! bytes. [`crate::file::io::read_uint`] and [`crate::file::io::write_uint`] return a
//! [`crate::Error::Schema`] for widths that are not a primitive integer size, since such a
//! width can only come from a broken field table.
//!
//! # Examples
//!
//! ```rust,ignore
//! use pescope::file::io::{read_le_at, write_le_at};
//!
//! let mut data = [0u8; 6];
//! let mut offset = 0;
//! write_le_at(&mut data, &mut offset, 0x10B_u16)?;
//! write_le_at(&mut data, &mut offset, 0x1000_u32)?;
//!
//! offset = 0;
//! let magic: u16 = read_le_at(&data, &mut offset)?;
//! assert_eq!(magic, 0x10B);
//! # Ok::<(), pescope::Error>(())
//! ```

use crate::{Error::OutOfBounds, Result};

/// Unsigned primitive that can be read from and written to little-endian byte buffers.
pub trait LeIO: Sized + Copy {
    /// Associated type representing the byte array type for this numeric type.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Read T from a byte array in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte array in little-endian
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_le_io {
    ($($ty:ty),*) => {
        $(
            impl LeIO for $ty {
                type Bytes = [u8; std::mem::size_of::<$ty>()];

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

impl_le_io!(u8, u16, u32, u64);

/// Safely reads a value of type `T` in little-endian byte order from the start of `data`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le<T: LeIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Safely reads a value of type `T` in little-endian byte order at `offset`, advancing
/// `offset` by the size of `T`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le_at<T: LeIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;

    Ok(T::from_le_bytes(read))
}

/// Safely writes `value` in little-endian byte order at `offset`, advancing `offset` by the
/// size of `T`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too small.
pub fn write_le_at<T: LeIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    data[*offset..end].copy_from_slice(value.to_le_bytes().as_ref());
    *offset = end;

    Ok(())
}

/// Reads an unsigned little-endian integer of `width` bytes at `offset`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes, or
/// [`crate::Error::Schema`] if `width` is not 1, 2, 4 or 8.
pub fn read_uint(data: &[u8], offset: usize, width: usize) -> Result<u64> {
    let mut offset = offset;
    match width {
        1 => Ok(u64::from(read_le_at::<u8>(data, &mut offset)?)),
        2 => Ok(u64::from(read_le_at::<u16>(data, &mut offset)?)),
        4 => Ok(u64::from(read_le_at::<u32>(data, &mut offset)?)),
        8 => read_le_at::<u64>(data, &mut offset),
        _ => Err(schema_error!("unsupported integer width {}", width)),
    }
}

/// Writes `value` as an unsigned little-endian integer of `width` bytes at `offset`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too small,
/// [`crate::Error::Schema`] if `width` is not 1, 2, 4 or 8 or `value` does not fit.
#[allow(clippy::cast_possible_truncation)]
pub fn write_uint(data: &mut [u8], offset: usize, width: usize, value: u64) -> Result<()> {
    if width < 8 && value >> (width * 8) != 0 {
        return Err(schema_error!(
            "value {:#x} does not fit into {} bytes",
            value,
            width
        ));
    }

    let mut offset = offset;
    match width {
        1 => write_le_at(data, &mut offset, value as u8),
        2 => write_le_at(data, &mut offset, value as u16),
        4 => write_le_at(data, &mut offset, value as u32),
        8 => write_le_at(data, &mut offset, value),
        _ => Err(schema_error!("unsupported integer width {}", width)),
    }
}

/// Reads a NUL-terminated byte string starting at `offset`, without the terminator.
///
/// The scan never runs past `data`; a string that is not terminated within the buffer is
/// reported as a format error.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `offset` is outside the buffer, or
/// [`crate::Error::Format`] if no terminator is found.
pub fn read_cstr(data: &[u8], offset: usize) -> Result<&[u8]> {
    if offset >= data.len() {
        return Err(OutOfBounds);
    }

    match data[offset..].iter().position(|&b| b == 0) {
        Some(len) => Ok(&data[offset..offset + len]),
        None => Err(format_error!(
            "String at offset {:#x} is not terminated before the end of the buffer",
            offset
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    const TEST_BUFFER: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    #[test]
    fn read_le_u8() {
        let result = read_le::<u8>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x01);
    }

    #[test]
    fn read_le_u16() {
        let result = read_le::<u16>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x0201);
    }

    #[test]
    fn read_le_u32() {
        let result = read_le::<u32>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x0403_0201);
    }

    #[test]
    fn read_le_u64() {
        let result = read_le::<u64>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x0807_0605_0403_0201);
    }

    #[test]
    fn read_le_from() {
        let mut offset = 2_usize;
        let result = read_le_at::<u16>(&TEST_BUFFER, &mut offset).unwrap();
        assert_eq!(result, 0x403);
        assert_eq!(offset, 4);
    }

    #[test]
    fn write_le_at_sequential() {
        let mut data = [0u8; 7];
        let mut offset = 0;

        write_le_at(&mut data, &mut offset, 0x01_u8).unwrap();
        write_le_at(&mut data, &mut offset, 0x0302_u16).unwrap();
        write_le_at(&mut data, &mut offset, 0x0706_0504_u32).unwrap();

        assert_eq!(data, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);
        assert_eq!(offset, 7);
    }

    #[test]
    fn dynamic_width() {
        assert_eq!(read_uint(&TEST_BUFFER, 0, 1).unwrap(), 0x01);
        assert_eq!(read_uint(&TEST_BUFFER, 2, 2).unwrap(), 0x0403);
        assert_eq!(read_uint(&TEST_BUFFER, 4, 4).unwrap(), 0x0807_0605);
        assert_eq!(read_uint(&TEST_BUFFER, 0, 8).unwrap(), 0x0807_0605_0403_0201);

        let mut data = [0u8; 8];
        write_uint(&mut data, 0, 8, 0x0807_0605_0403_0201).unwrap();
        assert_eq!(data, TEST_BUFFER);

        write_uint(&mut data, 6, 2, 0xBEEF).unwrap();
        assert_eq!(&data[6..], &[0xEF, 0xBE]);
    }

    #[test]
    fn dynamic_width_rejects_odd_sizes() {
        assert!(matches!(read_uint(&TEST_BUFFER, 0, 3), Err(Error::Schema(_))));

        let mut data = [0u8; 8];
        assert!(matches!(
            write_uint(&mut data, 0, 6, 1),
            Err(Error::Schema(_))
        ));
        assert!(matches!(
            write_uint(&mut data, 0, 2, 0x1_0000),
            Err(Error::Schema(_))
        ));
    }

    #[test]
    fn cstr() {
        let data = b"KERNEL32.dll\0junk";
        assert_eq!(read_cstr(data, 0).unwrap(), b"KERNEL32.dll");
        assert_eq!(read_cstr(data, 8).unwrap(), b".dll");
        assert!(matches!(read_cstr(data, 13), Err(Error::Format { .. })));
        assert!(matches!(read_cstr(data, 100), Err(OutOfBounds)));
    }

    #[test]
    fn errors() {
        let buffer = [0xFF, 0xFF, 0xFF, 0xFF];

        let result = read_le::<u64>(&buffer);
        assert!(matches!(result, Err(OutOfBounds)));

        let mut offset = usize::MAX;
        let result = read_le_at::<u16>(&buffer, &mut offset);
        assert!(matches!(result, Err(OutOfBounds)));

        let mut small = [0u8; 1];
        let mut offset = 0;
        assert!(matches!(
            write_le_at(&mut small, &mut offset, 1_u32),
            Err(OutOfBounds)
        ));
    }
}
