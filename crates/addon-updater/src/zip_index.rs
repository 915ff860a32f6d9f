//! ZIP central directory indexing.
//!
//! Lists the entries of an archive from its trailer and central directory
//! alone, so a remote package can be diffed with two small range reads.
//! The same parser serves local files and HTTP sources; only the
//! [`ByteSource`] differs. Single entries are extracted from a local copy
//! by seeking to their local header and inflating.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::DeflateDecoder;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::UpdateError;
use crate::http::HttpClient;

pub const EOCD_SIGNATURE: u32 = 0x0605_4b50;
pub const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
pub const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;

const EOCD_LEN: usize = 22;
const CENTRAL_HEADER_LEN: usize = 46;
const LOCAL_HEADER_LEN: usize = 30;

/// Bytes read from the end of an archive when looking for the EOCD: the
/// fixed record plus the longest comment it can carry.
pub const TAIL_LEN: u64 = EOCD_LEN as u64 + u16::MAX as u64;

/// Upper bound on parsed entries.
const MAX_ENTRIES: usize = 200_000;

pub const METHOD_STORED: u16 = 0;
pub const METHOD_DEFLATED: u16 = 8;

/// One central directory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZipEntry {
    pub file_name: String,
    pub method: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub local_header_offset: u64,
}

impl ZipEntry {
    /// Directory markers end with a slash.
    pub fn is_dir(&self) -> bool {
        self.file_name.ends_with('/') || self.file_name.ends_with('\\')
    }
}

/// Fields of the end-of-central-directory record we rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eocd {
    pub total_entries: u16,
    pub cd_size: u64,
    pub cd_offset: u64,
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Offset of the last EOCD signature in `buf`, scanning backward.
pub fn find_eocd(buf: &[u8]) -> Option<usize> {
    if buf.len() < EOCD_LEN {
        return None;
    }
    (0..=buf.len() - EOCD_LEN)
        .rev()
        .find(|&at| read_u32(buf, at) == EOCD_SIGNATURE)
}

/// Parse an EOCD record starting at the beginning of `buf`.
pub fn parse_eocd(buf: &[u8]) -> Result<Eocd, UpdateError> {
    if buf.len() < EOCD_LEN || read_u32(buf, 0) != EOCD_SIGNATURE {
        return Err(UpdateError::ZipFormat(
            "end of central directory record not found".to_string(),
        ));
    }
    let total_entries = read_u16(buf, 10);
    let cd_size = read_u32(buf, 12);
    let cd_offset = read_u32(buf, 16);
    if cd_size == u32::MAX || cd_offset == u32::MAX || total_entries == u16::MAX {
        return Err(UpdateError::ZipFormat(
            "ZIP64 archives are not supported".to_string(),
        ));
    }
    Ok(Eocd {
        total_entries,
        cd_size: u64::from(cd_size),
        cd_offset: u64::from(cd_offset),
    })
}

/// Parse consecutive central directory records.
///
/// Parsing stops at the first record whose signature does not match.
pub fn parse_central_directory(buf: &[u8]) -> Result<Vec<ZipEntry>, UpdateError> {
    let mut entries = Vec::new();
    let mut at = 0usize;

    while at + CENTRAL_HEADER_LEN <= buf.len() {
        if read_u32(buf, at) != CENTRAL_HEADER_SIGNATURE {
            break;
        }
        if entries.len() >= MAX_ENTRIES {
            return Err(UpdateError::ZipFormat(format!(
                "central directory exceeds {} entries",
                MAX_ENTRIES
            )));
        }

        let method = read_u16(buf, at + 10);
        let crc32 = read_u32(buf, at + 16);
        let compressed_size = read_u32(buf, at + 20);
        let uncompressed_size = read_u32(buf, at + 24);
        let name_len = read_u16(buf, at + 28) as usize;
        let extra_len = read_u16(buf, at + 30) as usize;
        let comment_len = read_u16(buf, at + 32) as usize;
        let local_header_offset = read_u32(buf, at + 42);

        let name_start = at + CENTRAL_HEADER_LEN;
        let name_end = name_start + name_len;
        if name_end > buf.len() {
            return Err(UpdateError::ZipFormat(
                "central directory record truncated".to_string(),
            ));
        }
        if compressed_size == u32::MAX
            || uncompressed_size == u32::MAX
            || local_header_offset == u32::MAX
        {
            return Err(UpdateError::ZipFormat(
                "ZIP64 entries are not supported".to_string(),
            ));
        }

        entries.push(ZipEntry {
            file_name: String::from_utf8_lossy(&buf[name_start..name_end]).into_owned(),
            method,
            crc32,
            compressed_size: u64::from(compressed_size),
            uncompressed_size: u64::from(uncompressed_size),
            local_header_offset: u64::from(local_header_offset),
        });

        at = name_end + extra_len + comment_len;
    }

    Ok(entries)
}

/// Trailing bytes of an object and the object's full size.
#[derive(Debug, Clone)]
pub struct Tail {
    pub bytes: Vec<u8>,
    pub total_size: u64,
}

/// Where archive bytes come from.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Read at most `max_len` bytes from the end of the object.
    async fn tail(&self, max_len: u64) -> Result<Tail, UpdateError>;

    /// Read `start..=end`.
    async fn range(&self, start: u64, end: u64) -> Result<Vec<u8>, UpdateError>;
}

/// List archive entries using only the trailer and central directory.
pub async fn list_entries(source: &dyn ByteSource) -> Result<Vec<ZipEntry>, UpdateError> {
    let tail = source.tail(TAIL_LEN).await?;
    let at = find_eocd(&tail.bytes).ok_or_else(|| {
        UpdateError::ZipFormat("end of central directory record not found".to_string())
    })?;
    let eocd = parse_eocd(&tail.bytes[at..])?;

    if eocd.cd_size == 0 {
        return Ok(Vec::new());
    }
    let cd_end = eocd.cd_offset + eocd.cd_size;
    if cd_end >= tail.total_size {
        return Err(UpdateError::ZipFormat(format!(
            "central directory [{}, {}) lies outside archive of {} bytes",
            eocd.cd_offset, cd_end, tail.total_size
        )));
    }

    let directory = source.range(eocd.cd_offset, cd_end - 1).await?;
    if directory.len() as u64 != eocd.cd_size {
        return Err(UpdateError::ZipFormat(format!(
            "central directory read returned {} of {} bytes",
            directory.len(),
            eocd.cd_size
        )));
    }

    let entries = parse_central_directory(&directory)?;
    debug!(
        entries = entries.len(),
        declared = eocd.total_entries,
        cd_size = eocd.cd_size,
        "Parsed central directory"
    );
    Ok(entries)
}

/// Archive on local disk.
#[derive(Debug, Clone)]
pub struct LocalZipFile {
    path: PathBuf,
}

impl LocalZipFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ByteSource for LocalZipFile {
    async fn tail(&self, max_len: u64) -> Result<Tail, UpdateError> {
        let mut file = File::open(&self.path)?;
        let total_size = file.metadata()?.len();
        let start = total_size.saturating_sub(max_len);
        file.seek(SeekFrom::Start(start))?;
        let mut bytes = Vec::with_capacity((total_size - start) as usize);
        file.read_to_end(&mut bytes)?;
        Ok(Tail { bytes, total_size })
    }

    async fn range(&self, start: u64, end: u64) -> Result<Vec<u8>, UpdateError> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(start))?;
        let mut bytes = Vec::new();
        file.take(end.saturating_sub(start) + 1)
            .read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

/// Archive behind an HTTP URL that honours range requests.
///
/// Each read tries the header sets in order and keeps the first 206.
pub struct RemoteZip<'a> {
    pub http: &'a HttpClient,
    pub url: &'a str,
    pub known_size: Option<u64>,
    pub header_candidates: Vec<HeaderMap>,
    pub timeout: Duration,
    pub cancel: Option<&'a CancellationToken>,
}

impl<'a> RemoteZip<'a> {
    fn candidates(&self) -> Vec<HeaderMap> {
        if self.header_candidates.is_empty() {
            vec![HeaderMap::new()]
        } else {
            self.header_candidates.clone()
        }
    }
}

#[async_trait]
impl<'a> ByteSource for RemoteZip<'a> {
    async fn tail(&self, max_len: u64) -> Result<Tail, UpdateError> {
        let mut last_error = None;
        for headers in self.candidates() {
            let attempt = match self.known_size.filter(|size| *size > 0) {
                Some(size) => {
                    let start = size.saturating_sub(max_len);
                    self.http
                        .fetch_range(self.url, start, size - 1, &headers, self.timeout, self.cancel)
                        .await
                        .map(|bytes| (bytes, Some(size)))
                }
                None => {
                    self.http
                        .fetch_suffix_range(self.url, max_len, &headers, self.timeout, self.cancel)
                        .await
                }
            };
            match attempt {
                Ok((bytes, total)) => {
                    let total_size = match total {
                        Some(total) => total,
                        None if (bytes.len() as u64) < max_len => bytes.len() as u64,
                        None => {
                            return Err(UpdateError::ZipFormat(
                                "range response is missing the Content-Range total".to_string(),
                            ))
                        }
                    };
                    return Ok(Tail {
                        bytes: bytes.to_vec(),
                        total_size,
                    });
                }
                Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or(UpdateError::RangeUnsupported { status: 0 }))
    }

    async fn range(&self, start: u64, end: u64) -> Result<Vec<u8>, UpdateError> {
        let mut last_error = None;
        for headers in self.candidates() {
            match self
                .http
                .fetch_range(self.url, start, end, &headers, self.timeout, self.cancel)
                .await
            {
                Ok(bytes) => return Ok(bytes.to_vec()),
                Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or(UpdateError::RangeUnsupported { status: 0 }))
    }
}

/// Where an entry's data lives in a local archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    pub method: u16,
    pub local_header_offset: u64,
    pub compressed_size: u64,
}

/// Extract one entry from a local archive into `dest`, returning its CRC32.
///
/// `dest` is written directly; callers pass a temp sibling and rename it
/// into place after checking the CRC.
pub fn extract_entry(zip_path: &Path, location: EntryLocation, dest: &Path) -> Result<u32, UpdateError> {
    let mut out = File::create(dest)?;
    let mut hasher = crc32fast::Hasher::new();

    if location.compressed_size == 0 {
        out.flush()?;
        return Ok(hasher.finalize());
    }

    let mut archive = File::open(zip_path)?;
    archive.seek(SeekFrom::Start(location.local_header_offset))?;
    let mut header = [0u8; LOCAL_HEADER_LEN];
    archive.read_exact(&mut header)?;
    if read_u32(&header, 0) != LOCAL_HEADER_SIGNATURE {
        return Err(UpdateError::ZipFormat(format!(
            "bad local header signature at offset {}",
            location.local_header_offset
        )));
    }
    let name_len = u64::from(read_u16(&header, 26));
    let extra_len = u64::from(read_u16(&header, 28));
    let data_start = location.local_header_offset + LOCAL_HEADER_LEN as u64 + name_len + extra_len;
    archive.seek(SeekFrom::Start(data_start))?;
    let data = archive.take(location.compressed_size);

    match location.method {
        METHOD_STORED => copy_hashed(data, &mut out, &mut hasher)?,
        METHOD_DEFLATED => copy_hashed(DeflateDecoder::new(data), &mut out, &mut hasher)?,
        other => {
            return Err(UpdateError::ZipFormat(format!(
                "unsupported compression method {}",
                other
            )))
        }
    }
    out.flush()?;
    Ok(hasher.finalize())
}

fn copy_hashed<R: Read>(
    mut reader: R,
    out: &mut File,
    hasher: &mut crc32fast::Hasher,
) -> io::Result<()> {
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            return Ok(());
        }
        hasher.update(&buffer[..bytes_read]);
        out.write_all(&buffer[..bytes_read])?;
    }
}

/// An entry a plan expects to find in the package.
#[derive(Debug, Clone, Copy)]
pub struct ExpectedEntry<'a> {
    pub entry_name: &'a str,
    pub method: u16,
    pub local_header_offset: u64,
    pub crc32: u32,
}

/// Check that every expected entry exists with the same offset, method and CRC.
pub fn validate_entries_match(
    entries: &[ZipEntry],
    expected: &[ExpectedEntry<'_>],
) -> Result<(), UpdateError> {
    let by_name: std::collections::HashMap<&str, &ZipEntry> = entries
        .iter()
        .map(|entry| (entry.file_name.as_str(), entry))
        .collect();

    for wanted in expected {
        let entry = by_name.get(wanted.entry_name).ok_or_else(|| {
            UpdateError::PackageMismatch(format!("entry {} is missing", wanted.entry_name))
        })?;
        if entry.local_header_offset != wanted.local_header_offset
            || entry.method != wanted.method
            || entry.crc32 != wanted.crc32
        {
            return Err(UpdateError::PackageMismatch(format!(
                "entry {} differs (offset {} vs {}, method {} vs {}, crc {:08x} vs {:08x})",
                wanted.entry_name,
                entry.local_header_offset,
                wanted.local_header_offset,
                entry.method,
                wanted.method,
                entry.crc32,
                wanted.crc32
            )));
        }
    }
    Ok(())
}
