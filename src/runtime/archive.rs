//! Tar helpers for the archive endpoints.

use std::io::Read;

use bytes::Bytes;

use crate::runtime::error::{Result, RuntimeError};

/// Pack a single file into a tar archive suitable for `upload_archive`.
///
/// `name` is relative to the directory passed to `upload_archive`.
pub fn pack_file(name: &str, contents: &[u8], mode: u32) -> Result<Bytes> {
    let name = name.trim_start_matches('/');
    if name.is_empty() {
        return Err(RuntimeError::protocol("archive entry name is empty"));
    }

    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, contents)?;
    Ok(Bytes::from(builder.into_inner()?))
}

/// Return the contents of the first regular file in a tar archive.
pub fn unpack_file(tar: &[u8]) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(tar);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            return Ok(buf);
        }
    }
    Err(RuntimeError::protocol("archive contains no regular file"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_then_unpack() {
        let tar = pack_file("/app/.env", b"PORT=8080\n", 0o644).unwrap();
        assert_eq!(tar.len() % 512, 0);
        assert_eq!(unpack_file(&tar).unwrap(), b"PORT=8080\n");
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(pack_file("/", b"x", 0o644).is_err());
    }

    #[test]
    fn test_unpack_empty_archive() {
        let builder = tar::Builder::new(Vec::new());
        let data = builder.into_inner().unwrap();
        assert!(unpack_file(&data).is_err());
    }
}
