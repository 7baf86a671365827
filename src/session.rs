//! Drives sequential multi-item watch, transfer, and publish runs. One
//! item's failure is surfaced and the run moves on; the summary reports the
//! counts at the end.

use crate::api::PlexClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ipc::{IpcEndpoint, PlayerIpc};
use crate::media::MediaItem;
use crate::store::{Queue, ResumeStore};
use crate::stream_server::{Publications, StreamServer};
use crate::tools;
use crate::tracker::ProgressTracker;
use log::{debug, warn};
use std::fmt;
use std::io::IsTerminal;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    verb: &'static str,
}

impl RunSummary {
    fn new(verb: &'static str, total: usize) -> Self {
        Self {
            total,
            succeeded: 0,
            failed: 0,
            verb,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} items, {} {}, {} failed",
            self.total, self.succeeded, self.verb, self.failed
        )
    }
}

/// Play each item in its own player session, tracking progress over IPC.
pub async fn watch_items(
    config: &Config,
    cache_dir: &Path,
    items: &[MediaItem],
    cancel: &CancellationToken,
) -> Result<RunSummary> {
    let mut summary = RunSummary::new("played", items.len());

    for (i, item) in items.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        println!("Playing {}", item.display_title());
        match watch_one(config, cache_dir, item, cancel).await {
            Ok(()) => summary.succeeded += 1,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                eprintln!("  failed: {e}");
                summary.failed += 1;
            }
        }
        if i + 1 < items.len() {
            confirm_continue(cancel).await?;
        }
    }

    println!("{summary}");
    Ok(summary)
}

async fn watch_one(
    config: &Config,
    cache_dir: &Path,
    item: &MediaItem,
    cancel: &CancellationToken,
) -> Result<()> {
    let client = PlexClient::new(&item.server_name, &item.server_url, &config.plex_token);
    let url = client.stream_url(&item.path).await?;
    println!("  {url}");

    let endpoint = IpcEndpoint::generate();
    let start = start_seconds(cache_dir, item);
    let mut child = tools::spawn_player(
        config,
        std::slice::from_ref(&url),
        Some(&endpoint.player_arg()),
        start,
    )?;

    let session_cancel = cancel.child_token();
    let ipc = tokio::select! {
        status = child.wait() => {
            debug!("player exited before IPC came up: {:?}", status);
            return Ok(());
        }
        connected = PlayerIpc::connect(&endpoint, &session_cancel) => match connected {
            Ok(ipc) => ipc,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        },
    };

    let tracker_cancel = session_cancel.child_token();
    let tracker = ProgressTracker::new(ipc, client, vec![item.clone()], tracker_cancel.clone());
    let tracker_task = tokio::spawn(tracker.run());

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            tracker_cancel.cancel();
            let _ = tracker_task.await;
            return Err(Error::Cancelled);
        }
    };

    tracker_cancel.cancel();
    if let Ok(Some((path, position_ms))) = tracker_task.await {
        if position_ms > 0 {
            if let Err(e) = ResumeStore::record(cache_dir, &path, position_ms) {
                warn!("could not record resume position: {e}");
            }
        }
    }

    // Non-zero is what the player returns on user quit.
    debug!("player exited with {status}");
    Ok(())
}

/// Larger of the server's view offset and the local resume point, in
/// seconds. The server stays authoritative; the local record only helps
/// when it is ahead.
fn start_seconds(cache_dir: &Path, item: &MediaItem) -> Option<f64> {
    let local = ResumeStore::get(cache_dir, &item.path)
        .ok()
        .flatten()
        .map(|p| p.position_ms)
        .unwrap_or(0);
    let best = item.view_offset_ms.max(local);
    (best > 0).then(|| best as f64 / 1000.0)
}

/// Fetch each item's backing file with the transfer tool. With `from_queue`
/// set, successfully fetched items are removed from the queue afterwards,
/// merge-style, so a concurrent instance's additions survive.
pub async fn transfer_items(
    config: &Config,
    cache_dir: &Path,
    items: &[MediaItem],
    from_queue: bool,
    cancel: &CancellationToken,
) -> Result<RunSummary> {
    let mut summary = RunSummary::new("fetched", items.len());
    let mut done_keys = Vec::new();

    for (i, item) in items.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        if item.transfer_path.is_empty() {
            eprintln!(
                "{}: no transfer path available",
                item.display_title()
            );
            summary.failed += 1;
            continue;
        }
        println!("Fetching {}", item.display_title());
        match tools::run_transfer(config, &item.transfer_path, ".").await {
            Ok(()) => {
                summary.succeeded += 1;
                done_keys.push(item.path.clone());
            }
            Err(e) => {
                eprintln!("  failed: {e}");
                summary.failed += 1;
            }
        }
        if i + 1 < items.len() {
            confirm_continue(cancel).await?;
        }
    }

    if from_queue && !done_keys.is_empty() {
        Queue::remove_by_keys(cache_dir, &done_keys)?;
    }

    println!("{summary}");
    Ok(summary)
}

/// Resolve and register every item up front, then serve the manifest until
/// the user quits.
pub async fn publish_items(
    config: &Config,
    items: &[MediaItem],
    port: u16,
    cancel: &CancellationToken,
) -> Result<RunSummary> {
    let mut summary = RunSummary::new("published", items.len());
    let publications = Publications::new();

    for item in items {
        let client = PlexClient::new(&item.server_name, &item.server_url, &config.plex_token);
        match client.stream_url(&item.path).await {
            Ok(url) => {
                let poster = item.thumb.as_ref().map(|thumb| {
                    format!("{}{}?X-Plex-Token={}", item.server_url, thumb, config.plex_token)
                });
                let id = publications.publish(item.clone(), url.clone(), poster).await;
                println!("{} ({id})", item.display_title());
                println!("  {url}");
                summary.succeeded += 1;
            }
            Err(e) => {
                eprintln!("{}: {e}", item.display_title());
                summary.failed += 1;
            }
        }
    }

    if publications.is_empty().await {
        println!("{summary}");
        return Err(Error::NotFound("nothing could be published".to_string()));
    }

    let server_cancel = cancel.child_token();
    let server = StreamServer::new(publications, port);
    let server_task = tokio::spawn(server.run(server_cancel.clone()));

    println!("Serving stream manifest on port {port}. Press ctrl-C or q to stop.");
    wait_for_quit(cancel).await;

    server_cancel.cancel();
    match server_task.await {
        Ok(result) => result?,
        Err(e) => warn!("stream server task failed: {e}"),
    }
    println!("{summary}");
    Ok(summary)
}

/// Newline-on-stdin gate between items, skipped off-terminal.
async fn confirm_continue(cancel: &CancellationToken) -> Result<()> {
    if !std::io::stdin().is_terminal() {
        return Ok(());
    }
    println!("Press Enter for the next item (ctrl-C to stop)");
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut line = String::new();
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        read = reader.read_line(&mut line) => {
            read?;
            Ok(())
        }
    }
}

/// Blocks until ctrl-C, a `q` line on stdin, or outer cancellation.
async fn wait_for_quit(cancel: &CancellationToken) {
    let mut reader = BufReader::new(tokio::io::stdin());
    loop {
        let mut line = String::new();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::signal::ctrl_c() => return,
            read = reader.read_line(&mut line) => {
                match read {
                    Ok(_) if line.trim().eq_ignore_ascii_case("q") => return,
                    Ok(n) if n > 0 => {}
                    _ => {
                        // stdin closed; only cancellation or the signal can
                        // stop us now.
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = tokio::signal::ctrl_c() => {}
                        }
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_formats_like_the_run_report() {
        let mut summary = RunSummary::new("played", 3);
        summary.succeeded = 2;
        summary.failed = 1;
        assert_eq!(summary.to_string(), "3 items, 2 played, 1 failed");
    }
}
