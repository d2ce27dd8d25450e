//! Common fixtures for the end-to-end scenarios
#![allow(dead_code)]

use outrigger_core::config::LoaderConfig;
use outrigger_core::PluginConfig;
use outrigger_loader::Loader;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The sample plugin built alongside these tests.
pub fn hello_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_outrigger-hello"))
}

/// Installs the sample plugin into `dir` as `file_name`. The plugin names
/// itself after the file stem.
///
/// Hard links are preferred: a freshly written executable can fail to spawn
/// while another test thread is forking.
pub fn install(dir: &Path, file_name: &str) -> PathBuf {
    let target = dir.join(file_name);
    if std::fs::hard_link(hello_binary(), &target).is_err() {
        std::fs::copy(hello_binary(), &target).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }
    target
}

pub fn sha1_hex(path: &Path) -> String {
    hex::encode(Sha1::digest(std::fs::read(path).unwrap()))
}

pub fn loader_settings(dir: &Path) -> LoaderConfig {
    LoaderConfig {
        directory: dir.to_path_buf(),
        handshake_timeout_secs: 15,
        call_timeout_secs: 10,
        broker_enabled: false,
        ..LoaderConfig::default()
    }
}

pub fn loader(dir: &Path, plugins: Vec<PluginConfig>) -> Arc<Loader> {
    Loader::new(&loader_settings(dir), plugins, Vec::new(), None)
}
