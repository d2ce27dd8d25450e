//! Integrity and permission checks applied before a binary is launched.

use crate::error::{PluginError, PluginResult};
use outrigger_core::HashAlgorithm;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

fn digest_file<D: Digest>(path: &Path) -> PluginResult<String> {
    let mut file = File::open(path)?;
    let mut hasher = D::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Computes the lowercase hex digest of a file.
pub fn compute_hash(path: &Path, algorithm: HashAlgorithm) -> PluginResult<String> {
    match algorithm {
        HashAlgorithm::Sha1 => digest_file::<Sha1>(path),
        HashAlgorithm::Sha256 => digest_file::<Sha256>(path),
    }
}

/// Compares a file's digest with `expected`, ignoring case.
pub fn verify_integrity(path: &Path, algorithm: HashAlgorithm, expected: &str) -> PluginResult<()> {
    let actual = compute_hash(path, algorithm)?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(PluginError::Integrity {
            path: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Rejects binaries that someone other than their owner could modify.
///
/// The owner must be the current effective user or root, and the file must
/// not be group- or world-writable.
#[cfg(unix)]
pub fn check_permissions(path: &Path) -> PluginResult<()> {
    use std::os::unix::fs::MetadataExt;

    let metadata = std::fs::metadata(path)?;
    let owner = metadata.uid();
    let current = nix::unistd::geteuid().as_raw();
    let denied = |reason: String| PluginError::Permission {
        path: path.display().to_string(),
        reason,
    };

    if owner != current && owner != 0 {
        return Err(denied(format!(
            "owned by uid {owner}, expected {current} or root"
        )));
    }

    let mode = metadata.mode();
    if mode & 0o022 != 0 {
        return Err(denied(format!(
            "mode {:o} is writable by group or others",
            mode & 0o777
        )));
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn check_permissions(path: &Path) -> PluginResult<()> {
    std::fs::metadata(path)?;
    Ok(())
}
