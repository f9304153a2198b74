//! Classic cpio ("newc") archive reader
//!
//! # Entry header
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  Magic "070701" / "070702" (6 bytes)     │
//! ├──────────────────────────────────────────┤
//! │  13 fields, 8 ASCII hex chars each       │  ino mode uid gid nlink mtime
//! │                                          │  filesize devmajor devminor
//! │                                          │  rdevmajor rdevminor namesize check
//! ├──────────────────────────────────────────┤
//! │  Name (namesize bytes, NUL-terminated)   │  padded to 4 bytes
//! ├──────────────────────────────────────────┤
//! │  Data (filesize bytes)                   │  padded to 4 bytes
//! └──────────────────────────────────────────┘
//! ```
//!
//! Parsing stops at the `TRAILER!!!` entry. Only headers and names are
//! read up front; entry data is read on demand through [`Entry`] handles.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::debug;

use crate::error::{ContainerError, ContainerResult};

const MAGIC_NEWC: &[u8; 6] = b"070701";
const MAGIC_NEWC_CRC: &[u8; 6] = b"070702";
const FIELD_COUNT: usize = 13;
const HEADER_LEN: usize = 6 + FIELD_COUNT * 8;
pub const TRAILER: &str = "TRAILER!!!";

// Field indices within the header
const FIELD_MODE: usize = 1;
const FIELD_MTIME: usize = 5;
const FIELD_FILESIZE: usize = 6;
const FIELD_NAMESIZE: usize = 11;

/// Longest member name accepted, including the NUL (Linux `PATH_MAX`)
pub const MAX_NAME_LEN: u64 = 4096;

fn pad4(n: u64) -> u64 {
    (4 - n % 4) % 4
}

/// Table entry for one archive member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpioEntry {
    pub name: String,
    pub mode: u32,
    pub mtime: u32,
    /// Absolute offset of the data in the underlying reader
    pub offset: u64,
    pub size: u64,
}

impl CpioEntry {
    pub fn is_dir(&self) -> bool {
        self.mode & 0o170000 == 0o040000
    }
}

/// A parsed cpio archive over any seekable reader
pub struct CpioArchive<R> {
    reader: R,
    entries: Vec<CpioEntry>,
}

impl CpioArchive<File> {
    /// Open an archive from disk
    pub fn open(path: impl AsRef<Path>) -> ContainerResult<Self> {
        Self::new(File::open(path)?)
    }
}

impl<R: Read + Seek> CpioArchive<R> {
    pub fn new(mut reader: R) -> ContainerResult<Self> {
        reader.seek(SeekFrom::Start(0))?;
        let mut entries = Vec::new();

        loop {
            let mut header = [0u8; HEADER_LEN];
            reader.read_exact(&mut header)?;

            let magic = &header[..6];
            if magic != MAGIC_NEWC && magic != MAGIC_NEWC_CRC {
                return Err(ContainerError::BadMagic {
                    found: String::from_utf8_lossy(magic).into_owned(),
                });
            }
            let fields = parse_fields(&header[6..])?;

            let namesize = u64::from(fields[FIELD_NAMESIZE]);
            if namesize > MAX_NAME_LEN {
                return Err(ContainerError::InvalidHeader(format!(
                    "name size {} exceeds {}",
                    namesize, MAX_NAME_LEN
                )));
            }
            let mut name = vec![0u8; namesize as usize];
            reader.read_exact(&mut name)?;
            // Name is NUL-terminated inside namesize
            if let Some(nul) = name.iter().position(|&b| b == 0) {
                name.truncate(nul);
            }
            let name = String::from_utf8(name)
                .map_err(|e| ContainerError::InvalidHeader(e.to_string()))?;
            reader.seek(SeekFrom::Current(pad4(HEADER_LEN as u64 + namesize) as i64))?;

            if name == TRAILER {
                break;
            }

            let size = u64::from(fields[FIELD_FILESIZE]);
            let offset = reader.stream_position()?;
            entries.push(CpioEntry {
                name,
                mode: fields[FIELD_MODE],
                mtime: fields[FIELD_MTIME],
                offset,
                size,
            });
            reader.seek(SeekFrom::Current((size + pad4(size)) as i64))?;
        }

        debug!(entries = entries.len(), "Parsed cpio archive");
        Ok(Self { reader, entries })
    }

    pub fn entries(&self) -> &[CpioEntry] {
        &self.entries
    }

    pub fn find(&self, name: &str) -> Option<&CpioEntry> {
        self.entries
            .iter()
            .find(|e| e.name == name || e.name.trim_start_matches("./") == name)
    }

    /// Lazy handle for the entry named `name`
    pub fn entry(&mut self, name: &str) -> ContainerResult<Entry<'_, R>> {
        let meta = self
            .find(name)
            .cloned()
            .ok_or_else(|| ContainerError::FileNotFound {
                name: name.to_string(),
            })?;
        Ok(Entry {
            reader: &mut self.reader,
            meta,
            pos: 0,
        })
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

fn parse_fields(raw: &[u8]) -> ContainerResult<[u32; FIELD_COUNT]> {
    let mut fields = [0u32; FIELD_COUNT];
    for (i, chunk) in raw.chunks_exact(8).enumerate().take(FIELD_COUNT) {
        let text = std::str::from_utf8(chunk)
            .map_err(|e| ContainerError::InvalidHeader(e.to_string()))?;
        fields[i] = u32::from_str_radix(text, 16).map_err(|_| {
            ContainerError::InvalidHeader(format!("field {} is not hex: '{}'", i, text))
        })?;
    }
    Ok(fields)
}

/// Lazily-read view of one archive entry
pub struct Entry<'a, R> {
    reader: &'a mut R,
    meta: CpioEntry,
    pos: u64,
}

impl<R: Read + Seek> Entry<'_, R> {
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn size(&self) -> u64 {
        self.meta.size
    }

    pub fn offset(&self) -> u64 {
        self.meta.offset
    }

    /// Bytes not yet read
    pub fn remaining(&self) -> u64 {
        self.meta.size - self.pos
    }

    /// Rewind to the start of the entry
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    /// Read the whole entry from the start
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        self.reset();
        let mut data = Vec::with_capacity(self.meta.size as usize);
        self.read_to_end(&mut data)?;
        Ok(data)
    }
}

impl<R: Read + Seek> Read for Entry<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let want = (buf.len() as u64).min(self.remaining()) as usize;
        if want == 0 {
            return Ok(0);
        }
        self.reader
            .seek(SeekFrom::Start(self.meta.offset + self.pos))?;
        let n = self.reader.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}
