// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
//#![deny(unsafe_code)]
// - 'file/physical.rs' uses mmap to map a file into memory

//! # pescope
//!
//! A declarative decoder, validator and byte-exact rebuilder for Windows PE/COFF images.
//! Every header is described by a field table; decoding a header keeps its exact byte range,
//! so an unmodified image can be written back out identically and a modified one is either
//! written correctly or rejected.
//!
//! ## Features
//!
//! - **Declarative headers** - COFF, optional and section headers are decoded through field
//!   tables, with repeated records sharing one cached schema
//! - **PE32 and PE32+** - the optional header switches its layout on the `Magic` field
//! - **Address translation** - RVA to file offset and back, with unmapped and ambiguous
//!   addresses reported as errors
//! - **Region validation** - every decoded structure declares the bytes it covers; partial
//!   overlaps are reported, gaps are listed
//! - **Import and base relocation tables** - decoded and patched back in place
//! - **Rebuild** - a three-phase layout pipeline with a byte-exact serializer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pescope::prelude::*;
//!
//! let data = std::fs::read("sample.exe")?;
//! let mut image = Image::from_mem(data.clone())?;
//!
//! if let Some(imports) = image.imports() {
//!     for module in imports.modules() {
//!         println!("{}", module.name);
//!     }
//! }
//!
//! image.validate()?;
//! let output = image.rebuild(&RebuildConfig::default())?;
//! assert_eq!(output, data);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - [`schema`] - field tables, schemas, header instances and the schema registry
//! - [`pe`] - the structural model: [`Image`], COFF, optional and section headers
//! - [`layout`] - address translation and region validation
//! - [`tables`] - import and base relocation decoders
//! - [`rebuild`] - section contents and the rebuild pipeline
//! - [`file`] - byte sources for images
//!
//! ## Thread Safety
//!
//! An [`Image`] is `Send + Sync`. The [`schema::SchemaRegistry`] may be shared between
//! threads; see [`Image::parse_all`].

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types.
///
/// # Example
///
/// ```rust,no_run
/// use pescope::prelude::*;
///
/// let image = Image::from_file("sample.exe".as_ref())?;
/// println!("{} sections", image.sections().len());
/// # Ok::<(), pescope::Error>(())
/// ```
pub mod prelude;

/// Byte sources: in-memory buffers and memory-mapped files.
pub mod file;

/// Declarative field tables and the headers decoded through them.
///
/// # Examples
///
/// ```rust
/// use pescope::schema::{decode, parse_table, Layout};
///
/// let rows = parse_table("0\t2\tMachine\tThe target machine type.\n2\t2\tNumberOfSections\tThe section count.")?;
/// let header = decode(&[0x4C, 0x01, 0x03, 0x00], 0, &rows, Layout::Narrow)?;
///
/// assert_eq!(header.u16("Machine")?, 0x14C);
/// assert_eq!(header.u16("NumberOfSections")?, 3);
/// # Ok::<(), pescope::Error>(())
/// ```
pub mod schema;

/// The PE structural model.
pub mod pe;

/// Address translation and region validation.
pub mod layout;

/// Import and base relocation table decoders.
pub mod tables;

/// Section contents and the rebuild pipeline.
pub mod rebuild;

/// `pescope` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
///
/// # Examples
///
/// ```rust,no_run
/// use pescope::{Image, Result};
///
/// fn load(path: &str) -> Result<Image> {
///     Image::from_file(std::path::Path::new(path))
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `pescope` Error type
///
/// # Examples
///
/// ```rust,no_run
/// use pescope::{Error, Image};
///
/// match Image::from_file(std::path::Path::new("sample.exe")) {
///     Ok(image) => println!("Loaded {} sections", image.sections().len()),
///     Err(Error::Format { message, .. }) => println!("Malformed: {}", message),
///     Err(e) => println!("Error: {}", e),
/// }
/// ```
pub use error::{AddressError, Error};

/// A decoded PE/COFF image.
///
/// See [`pe::Image`].
pub use pe::Image;
