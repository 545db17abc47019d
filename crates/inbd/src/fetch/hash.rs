//! Artifact digest verification.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256, Sha384, Sha512};

use inbd_core::{OpenMode, SafeFs};

use super::client::FetchError;
use crate::request::HashAlgorithm;

const READ_CHUNK: usize = 64 * 1024;

/// Hex digest of `bytes`.
pub fn digest_hex(algorithm: HashAlgorithm, bytes: &[u8]) -> String {
    match algorithm {
        HashAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
        HashAlgorithm::Sha384 => hex::encode(Sha384::digest(bytes)),
        HashAlgorithm::Sha512 => hex::encode(Sha512::digest(bytes)),
    }
}

fn file_digest<D: Digest>(fs: &SafeFs, path: &Path) -> Result<String, FetchError> {
    let mut file = fs.open(path, OpenMode::Read, 0)?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare the digest of the file at `path` with `expected_hex`.
///
/// Case and surrounding whitespace of `expected_hex` are ignored.
pub fn verify_hash(
    fs: &SafeFs,
    path: &Path,
    algorithm: HashAlgorithm,
    expected_hex: &str,
) -> Result<(), FetchError> {
    let actual = match algorithm {
        HashAlgorithm::Sha256 => file_digest::<Sha256>(fs, path)?,
        HashAlgorithm::Sha384 => file_digest::<Sha384>(fs, path)?,
        HashAlgorithm::Sha512 => file_digest::<Sha512>(fs, path)?,
    };
    let expected = expected_hex.trim().to_ascii_lowercase();
    if actual == expected {
        Ok(())
    } else {
        Err(FetchError::HashMismatch { expected, actual })
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn known_digests() {
        assert_eq!(
            digest_hex(HashAlgorithm::Sha256, b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(digest_hex(HashAlgorithm::Sha384, b"").len(), 96);
        assert_eq!(digest_hex(HashAlgorithm::Sha512, b"").len(), 128);
    }

    #[test]
    fn verify_matches_and_is_repeatable() {
        let dir = tempfile::Builder::new()
            .prefix("inbd-hash-")
            .tempdir_in("/tmp")
            .unwrap();
        let path = dir.path().join("a.raw");
        let body = vec![7u8; 200_000];
        std::fs::write(&path, &body).unwrap();
        let fs = SafeFs::default();

        let good = digest_hex(HashAlgorithm::Sha384, &body).to_uppercase();
        verify_hash(&fs, &path, HashAlgorithm::Sha384, &good).unwrap();
        verify_hash(&fs, &path, HashAlgorithm::Sha384, &good).unwrap();

        let bad = digest_hex(HashAlgorithm::Sha384, b"other");
        for _ in 0..2 {
            assert!(matches!(
                verify_hash(&fs, &path, HashAlgorithm::Sha384, &bad),
                Err(FetchError::HashMismatch { .. })
            ));
        }
    }
}
