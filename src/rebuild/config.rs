//! Rebuild configuration
//!
//! Controls where the rebuild pipeline starts laying out sections and which source bytes
//! that no decoded structure owns are carried over into the output.

/// Configuration for [`crate::Image::rebuild`]
///
/// The byte-carrying switches only matter for bytes outside every decoded structure:
/// the slack between the section table and the first section, the padding between a
/// section's content and the end of its raw data, and data appended after the last
/// section. With all of them enabled an unmodified image is reproduced byte for byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct RebuildConfig {
    /// RVA assigned to the first section (default: 0x1000)
    pub rva_base: u32,

    /// File offset assigned to the first section's raw data
    /// (default: `None`, derived from the headers and `SizeOfHeaders`)
    pub file_base: Option<u32>,

    /// Copy the source bytes between the section table and the first section instead of
    /// zero-filling them. Only applies while that range keeps its size.
    pub preserve_header_slack: bool,

    /// Copy the source bytes between a section's content and the end of its raw data
    /// instead of zero-filling them. Only applies to sections that keep their size.
    pub preserve_section_slack: bool,

    /// Append the source bytes found after the last section (overlay, e.g. installers or
    /// signatures)
    pub preserve_overlay: bool,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            rva_base: 0x1000,
            file_base: None,
            preserve_header_slack: true,
            preserve_section_slack: true,
            preserve_overlay: true,
        }
    }
}

impl RebuildConfig {
    /// Creates a configuration that emits only what the decoded structures describe
    ///
    /// All padding is zero-filled and any overlay is dropped.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            preserve_header_slack: false,
            preserve_section_slack: false,
            preserve_overlay: false,
            ..Self::default()
        }
    }

    /// Sets the RVA of the first section
    #[must_use]
    pub fn with_rva_base(mut self, rva_base: u32) -> Self {
        self.rva_base = rva_base;
        self
    }

    /// Sets the file offset of the first section's raw data
    #[must_use]
    pub fn with_file_base(mut self, file_base: u32) -> Self {
        self.file_base = Some(file_base);
        self
    }
}
