//! Manifest-driven zip archive
//!
//! The archive carries a `manifest.json` listing every image file:
//!
//! ```json
//! {
//!   "manifest_version": 5,
//!   "version": "1.4.2",
//!   "files": [
//!     { "name": "app.bin", "size": 1024, "sha256": "…", "version": "1.4.2", "type": "app" }
//!   ]
//! }
//! ```
//!
//! Every listed file is extracted and verified when the archive is opened,
//! so a successfully parsed archive only ever hands out verified bytes.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::digest::verify_sha256;
use crate::error::{ContainerError, ContainerResult};
use crate::image::{Image, ImageType};

pub const MANIFEST_NAME: &str = "manifest.json";

/// Manifest schema versions this reader understands
pub const SUPPORTED_MANIFEST_VERSIONS: [u64; 2] = [4, 5];

/// Parsed `manifest.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub manifest_version: u64,
    /// Firmware version of the package as a whole
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub size: u64,
    pub sha256: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(rename = "type")]
    pub image_type: String,
}

/// An opened, fully verified manifest archive
#[derive(Debug, Clone)]
pub struct ManifestArchive {
    manifest: Manifest,
    images: BTreeMap<(ImageType, bool), Image>,
}

impl ManifestArchive {
    pub fn parse(buf: impl Into<Bytes>) -> ContainerResult<Self> {
        let mut archive = zip::ZipArchive::new(Cursor::new(buf.into()))?;

        let manifest = read_manifest(&mut archive)?;
        if !SUPPORTED_MANIFEST_VERSIONS.contains(&manifest.manifest_version) {
            return Err(ContainerError::UnsupportedManifestVersion(
                manifest.manifest_version,
            ));
        }

        let mut images = BTreeMap::new();
        for file in &manifest.files {
            let (image_type, signed) = ImageType::parse_tagged(&file.image_type)?;
            let data = read_file(&mut archive, &file.name, file.size)?;

            if data.len() as u64 != file.size {
                return Err(ContainerError::SizeMismatch {
                    name: file.name.clone(),
                    expected: file.size,
                    actual: data.len() as u64,
                });
            }
            verify_sha256(&file.name, &data, &file.sha256)?;

            debug!(name = %file.name, image = %image_type, signed, size = file.size, "Verified archive file");
            images.insert(
                (image_type, signed),
                Image {
                    image_type,
                    signed,
                    data: Bytes::from(data),
                    sha256: file.sha256.clone(),
                },
            );
        }

        info!(
            manifest_version = manifest.manifest_version,
            version = manifest.version.as_deref().unwrap_or("unknown"),
            images = images.len(),
            "Opened manifest archive"
        );

        Ok(Self { manifest, images })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn manifest_version(&self) -> u64 {
        self.manifest.manifest_version
    }

    pub fn version(&self) -> Option<&str> {
        self.manifest.version.as_deref()
    }

    /// Image of `image_type`, the signed variant if the archive has one
    pub fn image(&self, image_type: ImageType) -> Option<&Image> {
        self.images
            .get(&(image_type, true))
            .or_else(|| self.images.get(&(image_type, false)))
    }

    pub fn has_image(&self, image_type: ImageType) -> bool {
        self.image(image_type).is_some()
    }

    /// Every image, signed and unsigned
    pub fn images(&self) -> impl Iterator<Item = &Image> {
        self.images.values()
    }
}

fn read_manifest<R: Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> ContainerResult<Manifest> {
    let mut manifest_file =
        archive
            .by_name(MANIFEST_NAME)
            .map_err(|_| ContainerError::FileNotFound {
                name: MANIFEST_NAME.to_string(),
            })?;

    let mut contents = String::new();
    manifest_file.read_to_string(&mut contents)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Upper bound on the buffer reserved up front for one member
const PREALLOC_LIMIT: u64 = 16 * 1024 * 1024;

/// Read `name`, stopping one byte past `declared` so oversized members
/// surface as a size mismatch
fn read_file<R: Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
    declared: u64,
) -> ContainerResult<Vec<u8>> {
    let file = archive
        .by_name(name)
        .map_err(|_| ContainerError::FileNotFound {
            name: name.to_string(),
        })?;

    let reserve = file.size().min(declared).min(PREALLOC_LIMIT);
    let mut data = Vec::with_capacity(reserve as usize);
    file.take(declared.saturating_add(1)).read_to_end(&mut data)?;
    Ok(data)
}
