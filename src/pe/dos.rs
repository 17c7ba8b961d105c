//! MS-DOS stub detection.
//!
//! Executables start with an MS-DOS header whose `e_lfanew` field at `0x3C` points to the
//! `PE\0\0` signature. Object files omit both and start directly with the COFF header.

use crate::{file::io::read_le, layout::Region, Result};

/// Offset of the `e_lfanew` field in the MS-DOS header.
pub const E_LFANEW_OFFSET: usize = 0x3C;

/// The PE signature that precedes the COFF header in executables.
pub const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";

/// The MS-DOS stub in front of the COFF header, including the PE signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosStub {
    pe_offset: usize,
}

impl DosStub {
    /// Looks for an MS-DOS stub at the start of `data`.
    ///
    /// Returns `None` if the input does not start with `MZ`, in which case the COFF header
    /// is expected at offset 0.
    ///
    /// # Errors
    /// Returns [`crate::Error::Format`] if the stub is truncated or `e_lfanew` does not point
    /// to a PE signature.
    pub fn detect(data: &[u8]) -> Result<Option<DosStub>> {
        if !data.starts_with(b"MZ") {
            return Ok(None);
        }

        let Some(field) = data.get(E_LFANEW_OFFSET..E_LFANEW_OFFSET + 4) else {
            return Err(format_error!(
                "MS-DOS header is truncated ({} bytes)",
                data.len()
            ));
        };
        let pe_offset = read_le::<u32>(field)? as usize;

        match pe_offset
            .checked_add(PE_SIGNATURE.len())
            .and_then(|end| data.get(pe_offset..end))
        {
            Some(signature) if signature == PE_SIGNATURE => Ok(Some(DosStub { pe_offset })),
            _ => Err(format_error!(
                "e_lfanew {:#x} does not point to a PE signature",
                pe_offset
            )),
        }
    }

    /// File offset of the PE signature.
    #[must_use]
    pub fn pe_offset(&self) -> usize {
        self.pe_offset
    }

    /// File offset of the COFF header following the signature.
    #[must_use]
    pub fn coff_offset(&self) -> usize {
        self.pe_offset + PE_SIGNATURE.len()
    }

    /// Regions covered by the stub.
    #[must_use]
    pub fn regions(&self) -> Vec<Region> {
        vec![
            Region::file(0_u32, self.pe_offset as u64, "MS-DOS Stub"),
            Region::file(self.pe_offset as u64, PE_SIGNATURE.len() as u64, "PE Signature"),
        ]
    }
}
