//! Core types shared by configuration and the plugin lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Kind of child binary managed by the loader.
///
/// Plugins and modules share one lifecycle; they differ in the file suffix
/// used for discovery and in the digest used for integrity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    Plugin,
    Module,
}

impl InstanceKind {
    /// All kinds, in discovery order.
    pub const ALL: [InstanceKind; 2] = [InstanceKind::Plugin, InstanceKind::Module];

    /// Platform-specific file suffix for binaries of this kind.
    pub fn suffix(&self) -> &'static str {
        match (self, cfg!(windows)) {
            (InstanceKind::Plugin, false) => ".plugin",
            (InstanceKind::Plugin, true) => ".plugin.exe",
            (InstanceKind::Module, false) => ".module",
            (InstanceKind::Module, true) => ".module.exe",
        }
    }

    /// Digest used when comparing a binary against its configured hash.
    pub fn hash_algorithm(&self) -> HashAlgorithm {
        match self {
            InstanceKind::Plugin => HashAlgorithm::Sha1,
            InstanceKind::Module => HashAlgorithm::Sha256,
        }
    }

    /// Classifies a path by its suffix.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        Self::ALL
            .into_iter()
            .find(|kind| name.len() > kind.suffix().len() && name.ends_with(kind.suffix()))
    }

    /// Strips the kind suffix from a file name.
    pub fn stem<'a>(&self, file_name: &'a str) -> &'a str {
        file_name.strip_suffix(self.suffix()).unwrap_or(file_name)
    }
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKind::Plugin => write!(f, "plugin"),
            InstanceKind::Module => write!(f, "module"),
        }
    }
}

/// Content digest used for binary integrity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// Length of the hex encoding of a digest.
    pub fn hex_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 40,
            HashAlgorithm::Sha256 => 64,
        }
    }

    /// Returns true if `value` looks like a hex digest of this algorithm.
    pub fn is_valid_hex(&self, value: &str) -> bool {
        value.len() == self.hex_len() && value.chars().all(|c| c.is_ascii_hexdigit())
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha1 => write!(f, "sha1"),
            HashAlgorithm::Sha256 => write!(f, "sha256"),
        }
    }
}
