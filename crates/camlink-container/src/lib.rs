//! camlink-container - upgrade-file container parsers
//!
//! Three independent readers extract named, integrity-verified firmware
//! images from an upgrade file:
//!
//! - [`MarkerContainer`]: JSON header, magic marker, hex signature, payload
//! - [`ManifestArchive`]: zip archive described by `manifest.json`
//! - [`CpioArchive`]: classic cpio "newc" archive carrying a disk image
//!
//! All parsed outputs are read-only; extracted images are cheap
//! reference-counted [`bytes::Bytes`] slices.

pub mod cpio;
pub mod digest;
pub mod error;
pub mod image;
pub mod manifest;
pub mod marker;

pub use cpio::{CpioArchive, CpioEntry, Entry};
pub use error::{ContainerError, ContainerResult};
pub use image::{Image, ImageType};
pub use manifest::{Manifest, ManifestArchive, ManifestFile};
pub use marker::{FileEntry, MarkerContainer};
