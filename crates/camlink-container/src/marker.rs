//! Marker-delimited container
//!
//! # Layout
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  JSON header (UTF-8, variable)      │  offset 0
//! ├─────────────────────────────────────┤
//! │  Marker (MARKER)                    │  offset h
//! ├─────────────────────────────────────┤
//! │  Signature (128 hex chars)          │  offset h + marker
//! ├─────────────────────────────────────┤
//! │  Payload region                     │  payload_start
//! └─────────────────────────────────────┘
//! ```
//!
//! The header is a JSON object; every member whose value is an
//! `{offset, size, sha256}` object describes one file, with `offset`
//! relative to the start of the payload region. Other members (a version
//! string, for example) are kept but not treated as files.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::digest::verify_sha256;
use crate::error::{ContainerError, ContainerResult};
use crate::image::{Image, ImageType};

/// Magic bytes separating the header from the signed region
pub const MARKER: &[u8] = b"\n--CAMLINK-CONTAINER--\n";

/// Length of the hex signature field following the marker
pub const SIGNATURE_LEN: usize = 128;

/// One file described by the container header
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileEntry {
    pub offset: u64,
    pub size: u64,
    pub sha256: String,
}

/// A parsed marker-delimited container
#[derive(Debug, Clone)]
pub struct MarkerContainer {
    buf: Bytes,
    header: Map<String, Value>,
    files: BTreeMap<String, FileEntry>,
    signature: String,
    payload_start: usize,
}

fn find_marker(buf: &[u8]) -> Option<usize> {
    buf.windows(MARKER.len()).position(|w| w == MARKER)
}

impl MarkerContainer {
    /// Check whether `buf` looks like a marker container
    ///
    /// True iff the marker occurs at a positive offset (a header precedes it).
    pub fn contains(buf: &[u8]) -> bool {
        matches!(find_marker(buf), Some(pos) if pos > 0)
    }

    pub fn parse(buf: impl Into<Bytes>) -> ContainerResult<Self> {
        let buf = buf.into();
        let marker_pos = find_marker(&buf)
            .filter(|&pos| pos > 0)
            .ok_or(ContainerError::MarkerNotFound)?;

        let header_text = std::str::from_utf8(&buf[..marker_pos])
            .map_err(|e| ContainerError::InvalidHeader(e.to_string()))?;
        let header: Map<String, Value> = match serde_json::from_str(header_text.trim())? {
            Value::Object(map) => map,
            _ => {
                return Err(ContainerError::InvalidHeader(
                    "header is not a JSON object".to_string(),
                ))
            }
        };

        let signature_start = marker_pos + MARKER.len();
        let payload_start = signature_start + SIGNATURE_LEN;
        let signature = buf
            .get(signature_start..payload_start)
            .ok_or_else(|| ContainerError::InvalidHeader("truncated signature".to_string()))?;
        if !signature.iter().all(u8::is_ascii_hexdigit) {
            return Err(ContainerError::InvalidHeader(
                "signature is not hex".to_string(),
            ));
        }
        let signature = String::from_utf8_lossy(signature).into_owned();

        let files = header
            .iter()
            .filter_map(|(name, value)| {
                serde_json::from_value::<FileEntry>(value.clone())
                    .ok()
                    .map(|entry| (name.clone(), entry))
            })
            .collect::<BTreeMap<_, _>>();

        debug!(
            files = files.len(),
            payload_start,
            len = buf.len(),
            "Parsed marker container"
        );

        Ok(Self {
            buf,
            header,
            files,
            signature,
            payload_start,
        })
    }

    /// The raw JSON header
    pub fn header(&self) -> &Map<String, Value> {
        &self.header
    }

    /// Hex signature over the payload region
    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn entry(&self, name: &str) -> Option<&FileEntry> {
        self.files.get(name)
    }

    /// The whole container as received
    pub fn as_bytes(&self) -> &Bytes {
        &self.buf
    }

    /// The signed payload region
    pub fn payload(&self) -> Bytes {
        self.buf.slice(self.payload_start..)
    }

    /// Extract a file and verify its SHA-256
    pub fn extract(&self, name: &str) -> ContainerResult<Bytes> {
        let not_found = || ContainerError::FileNotFound {
            name: name.to_string(),
        };
        let entry = self.files.get(name).ok_or_else(not_found)?;

        let start = usize::try_from(entry.offset)
            .ok()
            .and_then(|o| o.checked_add(self.payload_start))
            .ok_or_else(not_found)?;
        let end = usize::try_from(entry.size)
            .ok()
            .and_then(|s| start.checked_add(s))
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(not_found)?;

        let data = self.buf.slice(start..end);
        verify_sha256(name, &data, &entry.sha256)?;
        Ok(data)
    }

    /// Extract an image by type, preferring its signed variant
    pub fn image(&self, image_type: ImageType) -> ContainerResult<Image> {
        let signed = image_type.signed_name();
        let (name, is_signed) = if self.files.contains_key(&signed) {
            (signed.as_str(), true)
        } else {
            (image_type.as_str(), false)
        };
        let data = self.extract(name)?;
        let sha256 = self
            .files
            .get(name)
            .map(|e| e.sha256.clone())
            .unwrap_or_default();
        Ok(Image {
            image_type,
            signed: is_signed,
            data,
            sha256,
        })
    }
}
