//! Best-effort mirroring of saved files to a network share.
//!
//! The local save is the source of truth. Mirroring copies each file and
//! compares SHA-256 digests of source and copy; any failure (unmounted share,
//! full disk, digest mismatch) is logged and swallowed so a flaky network
//! never kills a measurement that already saved locally.

use anyhow::{Context, Result};
use log::{info, warn};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// SHA-256 of a file, streamed, as lowercase hex.
pub fn sha256_hex(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn mirror_one(source: &Path, mirror_dir: &Path) -> Result<()> {
    let name = source
        .file_name()
        .context("Mirror source has no file name")?;
    let dest = mirror_dir.join(name);
    std::fs::create_dir_all(mirror_dir)
        .with_context(|| format!("Failed to create {}", mirror_dir.display()))?;
    std::fs::copy(source, &dest)
        .with_context(|| format!("Failed to copy to {}", dest.display()))?;

    let local = sha256_hex(source)?;
    let remote = sha256_hex(&dest)?;
    if local != remote {
        anyhow::bail!(
            "Checksum mismatch after mirror: {} != {}",
            source.display(),
            dest.display()
        );
    }
    Ok(())
}

/// Copy `files` into `mirror_dir`, verifying each copy by checksum.
///
/// Never fails: problems are logged per file and the remaining files are
/// still attempted.
pub fn mirror_files(files: &[&Path], mirror_dir: &Path) {
    for path in files {
        match mirror_one(path, mirror_dir) {
            Ok(()) => info!("Mirrored {} to {}", path.display(), mirror_dir.display()),
            Err(e) => warn!("Mirror of {} failed: {e:#}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_hex(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn mirrors_and_verifies_files() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path().join("remote");
        let a = dir.path().join("run.json");
        let b = dir.path().join("run.h5");
        std::fs::write(&a, b"{}").unwrap();
        std::fs::write(&b, b"arrays").unwrap();

        mirror_files(&[&a, &b], &mirror);
        assert_eq!(std::fs::read(mirror.join("run.json")).unwrap(), b"{}");
        assert_eq!(
            sha256_hex(&a).unwrap(),
            sha256_hex(&mirror.join("run.json")).unwrap()
        );
    }

    #[test]
    fn missing_source_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        mirror_files(&[Path::new("/nonexistent/run.json")], dir.path());
        assert!(dir.path().read_dir().unwrap().next().is_none());
    }
}
