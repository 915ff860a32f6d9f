//! Content verification.
//!
//! Streaming MD5 and CRC32 digests, payload sniffing, and the gzip
//! fallback used when a server hashes the decompressed body but serves
//! it compressed.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use flate2::read::GzDecoder;
use md5::{Digest, Md5};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::error::{MismatchDetail, UpdateError};

/// Buffer size for hashing reads.
const HASH_BUFFER_SIZE: usize = 8192;

/// MD5 of empty input.
pub const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

/// Integrity token attached to an update action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integrity {
    Md5(String),
    Crc32(u32),
}

impl Integrity {
    /// Parse either a `crc32:<hex>` token or a bare MD5 hex digest.
    pub fn parse(token: &str) -> Option<Self> {
        if let Some(crc) = parse_crc32_token(token) {
            return Some(Integrity::Crc32(crc));
        }
        let trimmed = token.trim();
        if is_md5_hex(trimmed) {
            Some(Integrity::Md5(trimmed.to_ascii_lowercase()))
        } else {
            None
        }
    }
}

/// Render a CRC32 as the tagged `crc32:xxxxxxxx` token.
pub fn format_crc32(crc: u32) -> String {
    format!("crc32:{:08x}", crc)
}

/// Parse a `crc32:<hex>` token.
pub fn parse_crc32_token(token: &str) -> Option<u32> {
    let hex_part = token.trim().strip_prefix("crc32:")?;
    u32::from_str_radix(hex_part, 16).ok()
}

pub fn is_md5_hex(value: &str) -> bool {
    value.len() == 32 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Compare two hex digests case-insensitively in constant time.
pub fn digests_equal(a: &str, b: &str) -> bool {
    let a = a.trim().to_ascii_lowercase();
    let b = b.trim().to_ascii_lowercase();
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// MD5 of a byte slice as lowercase hex.
pub fn md5_bytes(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

/// Streaming MD5 of a reader.
pub fn md5_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Md5::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Streaming MD5 of a file.
pub fn md5_file(path: &Path) -> io::Result<String> {
    md5_reader(File::open(path)?)
}

/// Streaming CRC32 of a file.
pub fn crc32_file(path: &Path) -> io::Result<u32> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];
    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hasher.finalize())
}

pub fn is_zip_header(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[0] == b'P' && bytes[1] == b'K'
}

pub fn is_gzip_header(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Leading bytes of a file, used for magic sniffing.
pub fn read_header(path: &Path, len: usize) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(len);
    File::open(path)?.take(len as u64).read_to_end(&mut buffer)?;
    Ok(buffer)
}

/// Decompress a gzip file into `dest`.
pub fn gunzip_file(source: &Path, dest: &Path) -> io::Result<()> {
    let mut decoder = GzDecoder::new(File::open(source)?);
    let mut out = File::create(dest)?;
    let mut buffer = [0u8; HASH_BUFFER_SIZE];
    loop {
        let bytes_read = decoder.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        out.write_all(&buffer[..bytes_read])?;
    }
    out.flush()?;
    Ok(())
}

/// Which bytes satisfied the expected digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verified {
    /// Downloaded bytes matched as-is
    Raw,
    /// A gunzipped copy at the given path matched
    Unpacked(PathBuf),
}

/// MD5 verifier with the optional gzip fallback.
#[derive(Debug, Clone)]
pub struct ContentVerifier {
    gzip_fallback: bool,
}

impl ContentVerifier {
    pub fn new(gzip_fallback: bool) -> Self {
        Self { gzip_fallback }
    }

    /// Verify a downloaded file against an expected MD5.
    ///
    /// On a raw mismatch the payload is gunzipped next to the download and
    /// re-hashed. When that matches, the unpacked path is returned and the
    /// caller must install it instead of the raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `UpdateError::ChecksumMismatch` carrying the raw digest and,
    /// when attempted, the unpacked digest or gunzip failure.
    pub fn verify_md5(
        &self,
        path: &Path,
        expected: &str,
        subject: &str,
    ) -> Result<Verified, UpdateError> {
        let raw = md5_file(path)?;
        if digests_equal(&raw, expected) {
            debug!(subject, digest = %raw, "MD5 verified");
            return Ok(Verified::Raw);
        }

        if !self.gzip_fallback {
            return Err(UpdateError::ChecksumMismatch {
                subject: subject.to_string(),
                expected: expected.to_string(),
                raw,
                detail: MismatchDetail::None,
            });
        }

        let unpacked_path = unpacked_sibling(path);
        if let Err(e) = gunzip_file(path, &unpacked_path) {
            let _ = std::fs::remove_file(&unpacked_path);
            return Err(UpdateError::ChecksumMismatch {
                subject: subject.to_string(),
                expected: expected.to_string(),
                raw,
                detail: MismatchDetail::GunzipFailed(e.to_string()),
            });
        }

        let unpacked = md5_file(&unpacked_path)?;
        if digests_equal(&unpacked, expected) {
            warn!(
                subject,
                expected,
                raw = %raw,
                unpacked = %unpacked,
                "Accepted payload after gunzip fallback"
            );
            return Ok(Verified::Unpacked(unpacked_path));
        }

        let _ = std::fs::remove_file(&unpacked_path);
        Err(UpdateError::ChecksumMismatch {
            subject: subject.to_string(),
            expected: expected.to_string(),
            raw,
            detail: MismatchDetail::Unpacked(unpacked),
        })
    }
}

fn unpacked_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".unpacked");
    path.with_file_name(name)
}

/// Normalize a server integrity hash to MD5 hex.
///
/// Accepts, in order: plain MD5 hex, base64/base64url of the 16 digest
/// bytes, base64 text containing an MD5 hex, and base64 of gzip text
/// containing an MD5 hex.
pub fn normalize_integrity_hash_to_md5(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if is_md5_hex(trimmed) {
        return Some(trimmed.to_ascii_lowercase());
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    let decoded = [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(compact.as_bytes()).ok())?;

    if decoded.len() == 16 {
        return Some(hex::encode(decoded));
    }
    if let Some(found) = std::str::from_utf8(&decoded).ok().and_then(find_md5_hex) {
        return Some(found);
    }
    if is_gzip_header(&decoded) {
        let mut text = String::new();
        if GzDecoder::new(decoded.as_slice())
            .read_to_string(&mut text)
            .is_ok()
        {
            return find_md5_hex(&text);
        }
    }
    None
}

/// First standalone 32-character hex run in `text`.
fn find_md5_hex(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        if !bytes[start].is_ascii_hexdigit() {
            start += 1;
            continue;
        }
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_hexdigit() {
            end += 1;
        }
        if end - start == 32 {
            return Some(text[start..end].to_ascii_lowercase());
        }
        start = end;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_known_digests() {
        assert_eq!(md5_bytes(b""), EMPTY_MD5);
        assert_eq!(md5_bytes(b"hello"), "5d41402abc4b2a76b9719d911017c592");

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("check.txt");
        std::fs::write(&path, b"123456789").unwrap();
        assert_eq!(crc32_file(&path).unwrap(), 0xcbf4_3926);
        assert_eq!(format_crc32(0xcbf4_3926), "crc32:cbf43926");
    }

    #[test]
    fn test_integrity_parse() {
        assert_eq!(Integrity::parse("crc32:0000000a"), Some(Integrity::Crc32(10)));
        assert_eq!(
            Integrity::parse("5D41402ABC4B2A76B9719D911017C592"),
            Some(Integrity::Md5("5d41402abc4b2a76b9719d911017c592".to_string()))
        );
        assert_eq!(Integrity::parse("nope"), None);
    }

    #[test]
    fn test_digests_equal_ignores_case() {
        assert!(digests_equal("ABCDEF", "abcdef"));
        assert!(!digests_equal("abcdef", "abcdee"));
        assert!(!digests_equal("abc", "abcd"));
    }

    #[test]
    fn test_verify_raw_match() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.bin");
        std::fs::write(&path, b"hello").unwrap();

        let verifier = ContentVerifier::new(true);
        let result = verifier
            .verify_md5(&path, "5d41402abc4b2a76b9719d911017c592", "a.bin")
            .unwrap();
        assert_eq!(result, Verified::Raw);
    }

    #[test]
    fn test_verify_gzip_fallback_returns_unpacked() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.bin");
        std::fs::write(&path, gzip(b"hello")).unwrap();

        let verifier = ContentVerifier::new(true);
        let result = verifier
            .verify_md5(&path, "5d41402abc4b2a76b9719d911017c592", "a.bin")
            .unwrap();
        match result {
            Verified::Unpacked(unpacked) => {
                assert_eq!(std::fs::read(unpacked).unwrap(), b"hello");
            }
            Verified::Raw => panic!("expected unpacked match"),
        }
    }

    #[test]
    fn test_verify_mismatch_reports_both_digests() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.bin");
        std::fs::write(&path, gzip(b"hellp")).unwrap();

        let verifier = ContentVerifier::new(true);
        let err = verifier
            .verify_md5(&path, "5d41402abc4b2a76b9719d911017c592", "a.bin")
            .unwrap_err();
        match err {
            UpdateError::ChecksumMismatch { raw, detail, .. } => {
                assert_eq!(raw.len(), 32);
                assert_eq!(detail, MismatchDetail::Unpacked(md5_bytes(b"hellp")));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!temp.path().join("a.bin.unpacked").exists());
    }

    #[test]
    fn test_verify_plain_mismatch_reports_gunzip_failure() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.bin");
        std::fs::write(&path, b"hellp").unwrap();

        let err = ContentVerifier::new(true)
            .verify_md5(&path, "5d41402abc4b2a76b9719d911017c592", "a.bin")
            .unwrap_err();
        assert!(matches!(
            err,
            UpdateError::ChecksumMismatch {
                detail: MismatchDetail::GunzipFailed(_),
                ..
            }
        ));

        let err = ContentVerifier::new(false)
            .verify_md5(&path, "5d41402abc4b2a76b9719d911017c592", "a.bin")
            .unwrap_err();
        assert!(matches!(
            err,
            UpdateError::ChecksumMismatch {
                detail: MismatchDetail::None,
                ..
            }
        ));
    }

    #[test]
    fn test_normalize_integrity_hash_forms() {
        let md5 = "5d41402abc4b2a76b9719d911017c592";
        assert_eq!(normalize_integrity_hash_to_md5(md5).as_deref(), Some(md5));
        assert_eq!(
            normalize_integrity_hash_to_md5("XUFAKrxLKna5cZ2REBfFkg==").as_deref(),
            Some(md5)
        );
        assert_eq!(
            normalize_integrity_hash_to_md5("XUFAKrxLKna5cZ2REBfFkg").as_deref(),
            Some(md5)
        );

        let wrapped = STANDARD.encode(format!("md5={}\n", md5));
        assert_eq!(normalize_integrity_hash_to_md5(&wrapped).as_deref(), Some(md5));

        let gz = STANDARD.encode(gzip(md5.as_bytes()));
        assert_eq!(normalize_integrity_hash_to_md5(&gz).as_deref(), Some(md5));

        assert_eq!(normalize_integrity_hash_to_md5(""), None);
        assert_eq!(normalize_integrity_hash_to_md5("!!!"), None);
    }

    #[test]
    fn test_header_sniffing() {
        assert!(is_zip_header(b"PK\x03\x04rest"));
        assert!(!is_zip_header(b"PK"));
        assert!(is_gzip_header(&gzip(b"x")));
        assert!(!is_gzip_header(b"PK\x03\x04"));
    }
}
