//! Locating and invoking the external player and transfer tool. Absence is
//! reported, never guessed around.

use crate::config::Config;
use crate::error::{Error, Result};
use log::{debug, info};
use std::path::PathBuf;
use tokio::process::{Child, Command};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Player,
    Transfer,
    Finder,
}

impl Tool {
    pub fn name(self) -> &'static str {
        match self {
            Tool::Player => "mpv",
            Tool::Transfer => "rclone",
            Tool::Finder => "fzf",
        }
    }

    fn exe_name(self) -> &'static str {
        if cfg!(windows) {
            match self {
                Tool::Player => "mpv.exe",
                Tool::Transfer => "rclone.exe",
                Tool::Finder => "fzf.exe",
            }
        } else {
            self.name()
        }
    }

    fn override_path(self, config: &Config) -> &str {
        match self {
            Tool::Player => &config.mpv_path,
            Tool::Transfer => &config.rclone_path,
            Tool::Finder => &config.fzf_path,
        }
    }

    /// GUI bundles that ship the tool outside PATH on macOS.
    #[cfg(target_os = "macos")]
    fn bundle_paths(self) -> &'static [&'static str] {
        match self {
            Tool::Player => &[
                "/Applications/mpv.app/Contents/MacOS/mpv",
                "/Applications/IINA.app/Contents/MacOS/iina-cli",
            ],
            Tool::Transfer | Tool::Finder => &[],
        }
    }

    #[cfg(windows)]
    fn windows_candidates(self) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        match self {
            Tool::Player => {
                candidates.push(PathBuf::from(r"C:\ProgramData\chocolatey\bin\mpv.exe"));
                if let Ok(profile) = std::env::var("USERPROFILE") {
                    candidates.push(PathBuf::from(format!(r"{profile}\scoop\shims\mpv.exe")));
                }
                if let Ok(pf) = std::env::var("ProgramFiles") {
                    candidates.push(PathBuf::from(format!(r"{pf}\mpv\mpv.exe")));
                }
            }
            Tool::Transfer => {
                candidates.push(PathBuf::from(r"C:\rclone\rclone.exe"));
                candidates.push(PathBuf::from(r"C:\ProgramData\chocolatey\bin\rclone.exe"));
            }
            Tool::Finder => {
                candidates.push(PathBuf::from(r"C:\ProgramData\chocolatey\bin\fzf.exe"));
            }
        }
        candidates
    }
}

/// Resolution order: explicit config path, PATH lookup, then per-OS known
/// install locations.
pub fn locate(tool: Tool, config: &Config) -> Result<PathBuf> {
    let override_path = tool.override_path(config);
    if !override_path.is_empty() {
        let path = PathBuf::from(override_path);
        if path.is_file() {
            return Ok(path);
        }
        debug!("configured {} path {} does not exist", tool.name(), override_path);
        return Err(Error::ToolMissing(tool.name()));
    }

    if let Some(path) = search_in_path(tool.exe_name()) {
        return Ok(path);
    }

    #[cfg(target_os = "macos")]
    for candidate in tool.bundle_paths() {
        let path = PathBuf::from(candidate);
        if path.is_file() {
            return Ok(path);
        }
    }

    #[cfg(windows)]
    for candidate in tool.windows_candidates() {
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(Error::ToolMissing(tool.name()))
}

pub fn available(tool: Tool, config: &Config) -> bool {
    locate(tool, config).is_ok()
}

fn search_in_path(exe: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    for entry in std::env::split_paths(&paths) {
        let candidate = entry.join(exe);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Player argv per the documented flag surface. `--no-resume-playback` only
/// when no IPC endpoint is requested: with IPC the tracker owns resume.
pub fn player_args(
    stream_urls: &[String],
    ipc_endpoint: Option<&str>,
    start_seconds: Option<f64>,
) -> Vec<String> {
    let mut args = vec![
        "--force-seekable=yes".to_string(),
        "--hr-seek=yes".to_string(),
    ];
    if let Some(endpoint) = ipc_endpoint {
        args.push(format!("--input-ipc-server={endpoint}"));
    }
    if let Some(start) = start_seconds {
        args.push(format!("--start={start}"));
    }
    if ipc_endpoint.is_none() {
        args.push("--no-resume-playback".to_string());
    }
    args.extend(stream_urls.iter().cloned());
    args
}

/// Spawn the player. The caller waits on the child itself; a non-zero exit
/// is not an error (the player exits non-zero on user quit).
pub fn spawn_player(
    config: &Config,
    stream_urls: &[String],
    ipc_endpoint: Option<&str>,
    start_seconds: Option<f64>,
) -> Result<Child> {
    let binary = locate(Tool::Player, config)?;
    info!(
        "spawning {} for {} item(s)",
        binary.display(),
        stream_urls.len()
    );
    let child = Command::new(&binary)
        .args(player_args(stream_urls, ipc_endpoint, start_seconds))
        .spawn()?;
    Ok(child)
}

/// Run the transfer tool to completion. Its own progress output goes
/// straight to the terminal; the protocol is opaque to us.
pub async fn run_transfer(config: &Config, remote_path: &str, dest: &str) -> Result<()> {
    let binary = locate(Tool::Transfer, config)?;
    info!("{} copy {remote_path} {dest}", binary.display());
    let status = Command::new(&binary)
        .arg("copy")
        .arg(remote_path)
        .arg(dest)
        .arg("--progress")
        .status()
        .await?;
    if !status.success() {
        return Err(Error::ToolFailed("rclone", status));
    }
    Ok(())
}
