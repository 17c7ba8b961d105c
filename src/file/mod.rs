//! Byte sources for PE images.
//!
//! An [`crate::Image`] exclusively owns the buffer it was decoded from. This module abstracts
//! over where that buffer comes from, so the decoder can work on a memory-mapped file as well
//! as on an owned `Vec<u8>`:
//!
//! - [`crate::file::Backend`] - Trait for different data sources
//! - [`crate::file::Memory`] - In-memory buffer backend
//! - [`crate::file::Physical`] - Memory-mapped file backend for disk access
//! - [`crate::file::io`] - Little-endian primitive reads and writes
//!
//! Backends are read-only. Rebuilding an image never writes into its backend; the rebuild
//! pipeline produces a fresh output buffer, so the source stays valid for comparison.

pub mod io;

mod memory;
mod physical;

pub use memory::Memory;
pub use physical::Physical;

use crate::{Error::OutOfBounds, Result};

/// Backend trait for file data sources.
///
/// This trait abstracts over the source of PE data, allowing for both in-memory and on-disk
/// representations. All implementations must be thread-safe.
pub trait Backend: Send + Sync {
    /// Returns a slice of the data at the given offset and length.
    ///
    /// # Arguments
    ///
    /// * `offset` - The starting offset within the data.
    /// * `len` - The length of the slice in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the requested range is out of bounds.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let data = self.data();
        let Some(offset_end) = offset.checked_add(len) else {
            return Err(OutOfBounds);
        };

        if offset_end > data.len() {
            return Err(OutOfBounds);
        }

        Ok(&data[offset..offset_end])
    }

    /// Returns the entire data buffer.
    fn data(&self) -> &[u8];

    /// Returns the total length of the data buffer.
    fn len(&self) -> usize {
        self.data().len()
    }

    /// Returns `true` if the backend holds no data.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
