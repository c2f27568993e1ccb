//! On-disk naming and file helpers shared by the disk tiers.

use crate::error::Result;
use bytes::{Bytes, BytesMut};
use core_async::fs::File;
use core_async::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;

const MAX_EXTENSION_LEN: usize = 5;
const HASH_CHUNK: usize = 64 * 1024;

/// Derive a file extension from the last path component of `url`.
///
/// Lowercased, 1-5 ASCII alphanumerics; anything else yields `fallback`.
pub fn extension_from_url(url: &str, fallback: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or_default();
    let path = match without_query.split_once("://") {
        Some((_, rest)) => rest.find('/').map(|pos| &rest[pos..]).unwrap_or_default(),
        None => without_query,
    };

    let last = path.rsplit('/').next().unwrap_or_default();
    match last.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => fallback.to_string(),
    }
}

/// File-name-safe form of a track id.
pub fn file_stem(track_id: &str) -> String {
    track_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `{id}.{ext}.tmp`
pub fn temp_file_name(track_id: &str, extension: &str) -> String {
    format!("{}.{}.tmp", file_stem(track_id), extension)
}

/// `{id}.{ext}`
pub fn cache_file_name(track_id: &str, extension: &str) -> String {
    format!("{}.{}", file_stem(track_id), extension)
}

/// Size of the file at `path`, or `None` if it does not exist.
pub async fn file_len(path: &Path) -> Result<Option<u64>> {
    match core_async::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match core_async::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Read exactly `len` bytes starting at `offset`.
pub async fn read_range(path: &Path, offset: u64, len: u64) -> Result<Bytes> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let mut buffer = BytesMut::zeroed(len as usize);
    file.read_exact(&mut buffer).await?;
    Ok(buffer.freeze())
}

/// Hex SHA-256 of a file, streamed in chunks.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; HASH_CHUNK];

    loop {
        let read = file.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Hex SHA-256 of an in-memory buffer.
pub fn sha256_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_from_url() {
        assert_eq!(extension_from_url("https://cdn.test/a/song.MP3", "mp3"), "mp3");
        assert_eq!(extension_from_url("https://cdn.test/a/song.flac?sig=1", "mp3"), "flac");
        assert_eq!(extension_from_url("https://cdn.test/a/song.m4a#t=10", "mp3"), "m4a");
        assert_eq!(extension_from_url("https://cdn.test/stream", "mp3"), "mp3");
        assert_eq!(extension_from_url("https://cdn.test", "mp3"), "mp3");
        assert_eq!(extension_from_url("https://cdn.test/a/song.toolong", "mp3"), "mp3");
        assert_eq!(extension_from_url("https://cdn.test/a/.hidden", "ogg"), "ogg");
        assert_eq!(extension_from_url("https://cdn.test/a/song.mp-3", "mp3"), "mp3");
        assert_eq!(extension_from_url("/local/path/track.wav", "mp3"), "wav");
    }

    #[test]
    fn test_file_names() {
        assert_eq!(temp_file_name("T1", "mp3"), "T1.mp3.tmp");
        assert_eq!(cache_file_name("T1", "flac"), "T1.flac");
        assert_eq!(cache_file_name("a/b c", "mp3"), "a_b_c.mp3");
    }

    #[test]
    fn test_sha256_bytes() {
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_read_range_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        core_async::fs::write(&path, b"0123456789").await.unwrap();

        let middle = read_range(&path, 3, 4).await.unwrap();
        assert_eq!(&middle[..], b"3456");
        assert!(read_range(&path, 8, 4).await.is_err());

        assert_eq!(sha256_file(&path).await.unwrap(), sha256_bytes(b"0123456789"));
        assert_eq!(file_len(&path).await.unwrap(), Some(10));
        assert!(remove_if_exists(&path).await.unwrap());
        assert!(!remove_if_exists(&path).await.unwrap());
        assert_eq!(file_len(&path).await.unwrap(), None);
    }
}
