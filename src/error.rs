use thiserror::Error;

use crate::layout::AddressSpace;

macro_rules! format_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Format {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Format {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! schema_error {
    ($($arg:tt)*) => {
        crate::Error::Schema(format!($($arg)*))
    };
}

macro_rules! unsupported_resize {
    ($section:expr, $($arg:tt)*) => {
        crate::Error::UnsupportedResize {
            section: $section.to_string(),
            message: format!($($arg)*),
        }
    };
}

/// Failure of a single address translation.
///
/// Translation between file offsets and RVAs requires the input to fall into
/// exactly one section. Whether a failed translation aborts the surrounding
/// operation is up to the caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressError {
    /// No section maps the given address.
    #[error("{space} {value:#x} is not mapped by any section")]
    Unmapped {
        /// The address that failed to translate
        value: u64,
        /// The address space the value was given in
        space: AddressSpace,
    },

    /// More than one section claims the given address.
    #[error("{space} {value:#x} is mapped by {matches} sections")]
    Ambiguous {
        /// The address that failed to translate
        value: u64,
        /// The address space the value was given in
        space: AddressSpace,
        /// How many sections matched
        matches: usize,
    },
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// # Error Categories
///
/// ## Input Errors
/// - [`Error::Format`] - The bytes do not form a valid image (bad signature or magic,
///   missing table sentinel, relocation table length mismatch, truncated structure)
/// - [`Error::Empty`] - Empty input provided
/// - [`Error::OutOfBounds`] - Attempted to read beyond the end of the buffer
///
/// ## Authoring Errors
/// - [`Error::Schema`] - A declarative field table is malformed, which is a bug in the
///   table, not in the input
///
/// ## Layout Errors
/// - [`Error::Address`] - A file offset or RVA could not be translated
/// - [`Error::RegionConflict`] - Two declared regions partially overlap
///
/// ## Rebuild Errors
/// - [`Error::UnsupportedResize`] - A section changed size or position, which the rebuild
///   pipeline does not support yet
///
/// ## I/O Errors
/// - [`Error::FileError`] - Filesystem I/O errors
/// - [`Error::Error`] - Miscellaneous backend failures
///
/// # Examples
///
/// ```rust,no_run
/// use pescope::{Error, Image};
/// use std::path::Path;
///
/// match Image::from_file(Path::new("sample.exe")) {
///     Ok(image) => println!("{} sections", image.sections().len()),
///     Err(Error::Format { message, file, line }) => {
///         eprintln!("Not a valid image: {} ({}:{})", message, file, line);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The input is not a well-formed image.
    ///
    /// Includes the source location where the problem was detected for debugging purposes.
    #[error("Format - {file}:{line}: {message}")]
    Format {
        /// Description of what was malformed
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// A declarative field table could not be turned into a schema.
    ///
    /// Raised for cell-count mismatches in table text, unsupported field widths,
    /// overlapping or duplicate fields, and accesses to fields a schema does not have.
    #[error("Schema - {0}")]
    Schema(String),

    /// An address translation failed.
    #[error(transparent)]
    Address(#[from] AddressError),

    /// Two regions declared by the headers partially overlap.
    #[error("Region '{first}' partially overlaps '{second}' within {start:#x}..{end:#x}")]
    RegionConflict {
        /// Label of the outer region
        first: String,
        /// Label of the region crossing its boundary
        second: String,
        /// Start of the conflicting sub-range (file offset)
        start: u64,
        /// End of the conflicting sub-range (file offset, exclusive)
        end: u64,
    },

    /// The rebuild pipeline was asked for a structural change it cannot perform.
    #[error("Unsupported resize of '{section}': {message}")]
    UnsupportedResize {
        /// Name of the affected section
        section: String,
        /// What changed
        message: String,
    },

    /// An out of bound access was attempted while parsing the file.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// Provided input was empty. Counts as a format error, see [`Error::is_format`].
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures, such as a failed memory mapping.
    #[error("{0}")]
    Error(String),
}

impl Error {
    /// Returns `true` if this error is a format error, i.e. caused by the input bytes.
    #[must_use]
    pub fn is_format(&self) -> bool {
        matches!(self, Error::Format { .. } | Error::Empty | Error::OutOfBounds)
    }
}
