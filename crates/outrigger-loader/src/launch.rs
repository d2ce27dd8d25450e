//! Discovery and launch of child binaries.
//!
//! A launch verifies the binary, spawns it with the host marker and transport
//! settings in its environment, and waits a bounded time for the handshake
//! line on stdout. After the handshake every remaining stdout and stderr line
//! is drained to the debug log, and an exit watcher records the exit code.

use outrigger_core::{InstanceKind, PluginConfig};
use outrigger_plugin_api::broker::{ENV_BROKER_ADDR, ENV_BROKER_TOKEN};
use outrigger_plugin_api::host::{ENV_PLUGIN_COOKIE, ENV_PLUGIN_LOG_CAPACITY, PLUGIN_COOKIE_VALUE};
use outrigger_plugin_api::{security, Handshake, PluginError, PluginResult, TlsMaterial};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::instance::SIGNALLED_EXIT_CODE;

/// Lines of child output kept for diagnostics when a handshake fails.
const MAX_DIAGNOSTIC_LINES: usize = 64;

/// Lists binaries in `directory` carrying a plugin or module suffix, sorted
/// by path.
pub fn discover(directory: &Path) -> PluginResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let path = entry?.path();
        if path.is_file() && InstanceKind::from_path(&path).is_some() {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Settings shared by every launch.
#[derive(Clone, Default)]
pub struct LaunchSettings {
    pub handshake_timeout: Duration,
    /// Capacity of each child's log channel; 0 leaves the child's default.
    pub log_capacity: usize,
    pub tls: Option<TlsMaterial>,
    pub broker: Option<SocketAddr>,
}

/// A child whose handshake has been captured.
pub struct Launched {
    pub handshake: Handshake,
    pub cancel: CancellationToken,
    pub exit: watch::Receiver<Option<i32>>,
}

/// Verifies and spawns `config.path`, returning once the handshake is read.
pub async fn launch(
    kind: InstanceKind,
    config: &PluginConfig,
    settings: &LaunchSettings,
    broker_token: Option<&str>,
) -> PluginResult<Launched> {
    let path = &config.path;
    let shown = path.display().to_string();

    if let Some(ref expected) = config.hash {
        security::verify_integrity(path, kind.hash_algorithm(), expected)?;
    }
    security::check_permissions(path)?;

    let mut command = Command::new(path);
    command
        .env(ENV_PLUGIN_COOKIE, PLUGIN_COOKIE_VALUE)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if settings.log_capacity > 0 {
        command.env(ENV_PLUGIN_LOG_CAPACITY, settings.log_capacity.to_string());
    }
    if let Some(ref tls) = settings.tls {
        for (key, value) in tls.env_vars() {
            command.env(key, value);
        }
    }
    if let (Some(addr), Some(token)) = (settings.broker, broker_token) {
        command
            .env(ENV_BROKER_ADDR, addr.to_string())
            .env(ENV_BROKER_TOKEN, token);
    }
    if let Some(ref user) = config.user {
        run_as(&mut command, user, &shown)?;
    }

    let mut child = command.spawn().map_err(|e| PluginError::Launch {
        path: shown.clone(),
        reason: e.to_string(),
    })?;
    debug!(path = %shown, pid = ?child.id(), "Spawned child process");

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(PluginError::Launch {
            path: shown,
            reason: "child stdio was not captured".to_string(),
        });
    };
    let label = kind.stem(path.file_name().and_then(|n| n.to_str()).unwrap_or_default()).to_string();
    tokio::spawn(drain(BufReader::new(stderr).lines(), label, "stderr"));

    let mut stdout = BufReader::new(stdout).lines();
    let mut output = Vec::new();
    let handshake = match tokio::time::timeout(
        settings.handshake_timeout,
        read_handshake(&mut stdout, &mut output, &shown),
    )
    .await
    {
        Ok(Ok(handshake)) => handshake,
        Ok(Err(e)) => {
            warn!(path = %shown, error = %e, output = %output.join("\n"), "Handshake failed");
            terminate(&mut child).await;
            return Err(e);
        }
        Err(_) => {
            terminate(&mut child).await;
            return Err(PluginError::HandshakeTimeout {
                path: shown,
                timeout: settings.handshake_timeout,
                output: output.join("\n"),
            });
        }
    };

    info!(
        path = %shown,
        name = %handshake.name,
        address = %handshake.address(),
        protocol = %handshake.rpc_protocol,
        "Captured handshake"
    );

    tokio::spawn(drain(stdout, handshake.name.clone(), "stdout"));

    let cancel = CancellationToken::new();
    let (exit_tx, exit) = watch::channel(None);
    tokio::spawn(watch_exit(child, handshake.name.clone(), cancel.clone(), exit_tx));

    Ok(Launched {
        handshake,
        cancel,
        exit,
    })
}

/// Reads stdout until a handshake line appears. Noise before it is kept for
/// the error report.
async fn read_handshake(
    lines: &mut Lines<BufReader<ChildStdout>>,
    output: &mut Vec<String>,
    shown: &str,
) -> PluginResult<Handshake> {
    loop {
        match lines.next_line().await? {
            Some(line) => {
                if let Some(parsed) = Handshake::find(&line) {
                    return parsed.map_err(|e| with_output(e, output));
                }
                if output.len() < MAX_DIAGNOSTIC_LINES {
                    output.push(line);
                }
            }
            None => {
                return Err(PluginError::Launch {
                    path: shown.to_string(),
                    reason: format!(
                        "exited before announcing a handshake; output: {}",
                        output.join("\n")
                    ),
                })
            }
        }
    }
}

/// Folds the lines printed before a bad handshake into the parse error.
fn with_output(error: PluginError, output: &[String]) -> PluginError {
    match error {
        PluginError::MalformedHandshake { line, reason } if !output.is_empty() => {
            PluginError::MalformedHandshake {
                line,
                reason: format!("{reason}; preceding output: {}", output.join("\n")),
            }
        }
        other => other,
    }
}

async fn drain<R>(mut lines: Lines<BufReader<R>>, name: String, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: "plugin", plugin = %name, stream, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(plugin = %name, stream, error = %e, "Stopped reading child output");
                break;
            }
        }
    }
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill child process");
    }
}

/// Waits for the child to exit, killing it when `cancel` fires, and records
/// the exit code once.
async fn watch_exit(
    mut child: Child,
    name: String,
    cancel: CancellationToken,
    exit_tx: watch::Sender<Option<i32>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            if let Err(e) = child.start_kill() {
                warn!(plugin = %name, error = %e, "Failed to signal child process");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code().unwrap_or(SIGNALLED_EXIT_CODE),
        Err(e) => {
            warn!(plugin = %name, error = %e, "Failed to wait for child process");
            SIGNALLED_EXIT_CODE
        }
    };
    exit_tx.send_replace(Some(code));
    cancel.cancel();

    info!(plugin = %name, exit_code = code, "Child process exited");
}

#[cfg(unix)]
fn run_as(command: &mut Command, user: &str, shown: &str) -> PluginResult<()> {
    let launch_error = |reason: String| PluginError::Launch {
        path: shown.to_string(),
        reason,
    };
    let entry = nix::unistd::User::from_name(user)
        .map_err(|e| launch_error(format!("failed to look up user {user}: {e}")))?
        .ok_or_else(|| launch_error(format!("unknown user {user}")))?;
    command.uid(entry.uid.as_raw()).gid(entry.gid.as_raw());
    Ok(())
}

#[cfg(not(unix))]
fn run_as(_command: &mut Command, user: &str, shown: &str) -> PluginResult<()> {
    Err(PluginError::Launch {
        path: shown.to_string(),
        reason: format!("running as {user} is only supported on unix"),
    })
}
