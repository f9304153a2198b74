//! Firmware image model

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::error::ContainerError;

/// Prefix marking the signed variant of an image type name
pub const SIGNED_PREFIX: &str = "signed_";

/// Firmware image roles understood by the flash layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ImageType {
    /// First-stage boot loader
    Fsbl,
    SsblHeader,
    /// Second-stage boot loader body
    Ssbl,
    AppHeader,
    App,
}

impl ImageType {
    pub const ALL: [ImageType; 5] = [
        ImageType::Fsbl,
        ImageType::SsblHeader,
        ImageType::Ssbl,
        ImageType::AppHeader,
        ImageType::App,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageType::Fsbl => "fsbl",
            ImageType::SsblHeader => "ssbl_header",
            ImageType::Ssbl => "ssbl",
            ImageType::AppHeader => "app_header",
            ImageType::App => "app",
        }
    }

    /// Name of the signed variant, e.g. `signed_app`
    pub fn signed_name(&self) -> String {
        format!("{}{}", SIGNED_PREFIX, self.as_str())
    }

    /// Parse a type name that may carry the signed prefix
    ///
    /// Returns the base type and whether the name was the signed variant.
    pub fn parse_tagged(name: &str) -> Result<(ImageType, bool), ContainerError> {
        match name.strip_prefix(SIGNED_PREFIX) {
            Some(base) => Ok((base.parse()?, true)),
            None => Ok((name.parse()?, false)),
        }
    }
}

impl FromStr for ImageType {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ContainerError::UnknownImageType(s.to_string()))
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An extracted, verified firmware image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub image_type: ImageType,
    pub signed: bool,
    pub data: Bytes,
    /// Declared hex SHA-256, already checked against `data`
    pub sha256: String,
}

impl Image {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
