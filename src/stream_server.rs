//! Publishes stream URLs to the local network: an HTTP manifest served by
//! axum plus an mDNS advertisement other instances can browse for.

use crate::error::{Error, Result};
use crate::media::{MediaItem, MediaKind};
use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PORT: u16 = 8765;
pub const SERVICE_TYPE: &str = "_goplexcli._tcp.local.";

const MDNS_SHUTDOWN_CAP: Duration = Duration::from_secs(2);
const HTTP_SHUTDOWN_CAP: Duration = Duration::from_secs(3);
const FALLBACK_INSTANCE: &str = "plexcli";

/// A stream made discoverable on the local network. Lives until the owning
/// process exits or the user removes it; the catalog entry inside is not
/// mutated for the publication's lifetime.
#[derive(Debug, Clone)]
pub struct Publication {
    pub id: String,
    pub item: MediaItem,
    pub stream_url: String,
    pub poster_url: Option<String>,
    pub published_at: DateTime<Utc>,
}

impl Publication {
    fn manifest_entry(&self) -> StreamEntry {
        StreamEntry {
            id: self.id.clone(),
            title: self.item.display_title(),
            kind: self.item.kind,
            year: self.item.year,
            duration: self.item.duration_ms,
            summary: self.item.summary.clone(),
            stream_url: self.stream_url.clone(),
            poster_url: self.poster_url.clone(),
            published_at: self.published_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEntry {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub year: Option<u32>,
    pub duration: u64,
    pub summary: String,
    pub stream_url: String,
    pub poster_url: Option<String>,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamManifest {
    pub streams: Vec<StreamEntry>,
    pub count: usize,
}

/// In-memory publication map behind a reader-writer lock: manifest readers
/// run concurrently, publish/remove take the write half.
#[derive(Clone, Default)]
pub struct Publications {
    inner: Arc<RwLock<HashMap<String, Publication>>>,
    clock: Arc<AtomicU64>,
}

impl Publications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nanosecond stamp forced strictly monotonic across calls so ids sort
    /// in publication order even when the wall clock stalls.
    fn next_stamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let prev = self
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or(0);
        now.max(prev + 1)
    }

    pub async fn publish(
        &self,
        item: MediaItem,
        stream_url: String,
        poster_url: Option<String>,
    ) -> String {
        let stamp = self.next_stamp();
        let id = format!("stream-{stamp}");
        let publication = Publication {
            id: id.clone(),
            item,
            stream_url,
            poster_url,
            published_at: DateTime::from_timestamp_nanos(stamp as i64),
        };
        debug!("published {id}");
        self.inner.write().await.insert(id.clone(), publication);
        id
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.inner.write().await.remove(id).is_some()
    }

    pub async fn manifest(&self) -> StreamManifest {
        let map = self.inner.read().await;
        let mut streams: Vec<StreamEntry> = map.values().map(Publication::manifest_entry).collect();
        streams.sort_by(|a, b| {
            a.published_at
                .cmp(&b.published_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        StreamManifest {
            count: streams.len(),
            streams,
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

async fn manifest_handler(State(publications): State<Publications>) -> Json<StreamManifest> {
    Json(publications.manifest().await)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn index_handler(State(publications): State<Publications>) -> Html<String> {
    let manifest = publications.manifest().await;
    let mut body = String::from("<html><head><title>plexcli streams</title></head><body><h1>Published streams</h1><ul>");
    for stream in &manifest.streams {
        body.push_str(&format!(
            "<li>{} — <a href=\"{}\">stream</a> (since {})</li>",
            stream.title,
            stream.stream_url,
            stream.published_at.to_rfc3339()
        ));
    }
    if manifest.streams.is_empty() {
        body.push_str("<li>nothing published</li>");
    }
    body.push_str("</ul></body></html>");
    Html(body)
}

pub fn router(publications: Publications) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/streams", get(manifest_handler))
        .route("/health", get(health_handler))
        .with_state(publications)
}

pub struct StreamServer {
    publications: Publications,
    port: u16,
}

impl StreamServer {
    pub fn new(publications: Publications, port: u16) -> Self {
        Self { publications, port }
    }

    /// Serves until cancelled. The HTTP listener is bound before the mDNS
    /// registration goes out, so a discoverer that fetches the manifest on
    /// the first answer cannot race the listener. Shutdown tears down mDNS
    /// first (2 s cap), then HTTP (3 s cap).
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        let port = listener.local_addr()?.port();
        info!("stream server listening on port {port}");

        let mdns = advertise(port)?;

        let http_cancel = CancellationToken::new();
        let server = {
            let http_cancel = http_cancel.clone();
            let app = router(self.publications.clone());
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { http_cancel.cancelled().await })
                    .await
            })
        };

        cancel.cancelled().await;

        shutdown_mdns(mdns);
        http_cancel.cancel();
        match tokio::time::timeout(HTTP_SHUTDOWN_CAP, server).await {
            Ok(Ok(Ok(()))) => debug!("HTTP server shut down cleanly"),
            Ok(Ok(Err(e))) => return Err(e.into()),
            Ok(Err(e)) => warn!("stream server task failed: {e}"),
            Err(_) => warn!("HTTP shutdown exceeded {HTTP_SHUTDOWN_CAP:?}, forcing exit"),
        }
        Ok(())
    }
}

struct MdnsHandle {
    daemon: ServiceDaemon,
    fullname: String,
}

fn advertise(port: u16) -> Result<MdnsHandle> {
    let instance = hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| FALLBACK_INSTANCE.to_string());

    let daemon =
        ServiceDaemon::new().map_err(|e| Error::Transport(format!("mDNS daemon: {e}")))?;
    let service = ServiceInfo::new(
        SERVICE_TYPE,
        &instance,
        &format!("{instance}.local."),
        (),
        port,
        &[("path", "/streams")][..],
    )
    .map_err(|e| Error::Transport(format!("mDNS service: {e}")))?
    .enable_addr_auto();

    let fullname = service.get_fullname().to_string();
    daemon
        .register(service)
        .map_err(|e| Error::Transport(format!("mDNS register: {e}")))?;
    info!("advertising {fullname}");
    Ok(MdnsHandle { daemon, fullname })
}

fn shutdown_mdns(handle: MdnsHandle) {
    match handle.daemon.unregister(&handle.fullname) {
        Ok(receiver) => match receiver.recv_timeout(MDNS_SHUTDOWN_CAP) {
            Ok(status) => debug!("mDNS unregistered: {status:?}"),
            Err(_) => warn!("mDNS unregister exceeded {MDNS_SHUTDOWN_CAP:?}, proceeding"),
        },
        Err(e) => warn!("mDNS unregister failed: {e}"),
    }
    if let Err(e) = handle.daemon.shutdown() {
        warn!("mDNS daemon shutdown failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(title: &str) -> MediaItem {
        MediaItem {
            path: "/library/metadata/1".to_string(),
            title: title.to_string(),
            kind: MediaKind::Movie,
            show_title: None,
            season_title: None,
            season: None,
            episode: None,
            year: Some(2016),
            duration_ms: 6_960_000,
            rating: 0.0,
            summary: "linguist meets heptapods".to_string(),
            content_rating: String::new(),
            genre: String::new(),
            director: String::new(),
            cast: String::new(),
            studio: String::new(),
            thumb: None,
            file_path: String::new(),
            transfer_path: String::new(),
            view_offset_ms: 0,
            view_count: 0,
            server_name: "srv".to_string(),
            server_url: "http://srv:32400".to_string(),
        }
    }

    #[tokio::test]
    async fn publication_ids_are_monotonic() {
        let publications = Publications::new();
        let mut stamps = Vec::new();
        for _ in 0..16 {
            let id = publications
                .publish(item("a"), "http://h/f".to_string(), None)
                .await;
            let stamp: u64 = id.strip_prefix("stream-").unwrap().parse().unwrap();
            stamps.push(stamp);
        }
        for pair in stamps.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[tokio::test]
    async fn manifest_reports_count_and_wire_shape() {
        let publications = Publications::new();
        publications
            .publish(
                item("Arrival"),
                "http://host/file?X-Plex-Token=t".to_string(),
                None,
            )
            .await;

        let manifest = publications.manifest().await;
        assert_eq!(manifest.count, 1);

        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["count"], 1);
        let stream = &value["streams"][0];
        assert!(stream["id"].as_str().unwrap().starts_with("stream-"));
        assert_eq!(stream["type"], "movie");
        assert_eq!(stream["stream_url"], "http://host/file?X-Plex-Token=t");
        assert_eq!(stream["duration"], 6_960_000);
        // RFC 3339 timestamp.
        let published = stream["published_at"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(published).is_ok());
    }

    #[tokio::test]
    async fn manifest_orders_by_publication_time() {
        let publications = Publications::new();
        publications
            .publish(item("first"), "http://h/1".to_string(), None)
            .await;
        publications
            .publish(item("second"), "http://h/2".to_string(), None)
            .await;

        let manifest = publications.manifest().await;
        assert_eq!(manifest.streams[0].stream_url, "http://h/1");
        assert_eq!(manifest.streams[1].stream_url, "http://h/2");
    }

    #[tokio::test]
    async fn remove_unpublishes() {
        let publications = Publications::new();
        let id = publications
            .publish(item("a"), "http://h/f".to_string(), None)
            .await;
        assert!(publications.remove(&id).await);
        assert!(!publications.remove(&id).await);
        assert!(publications.is_empty().await);
    }

    #[test]
    fn health_wire_shape() {
        let body = serde_json::json!({"status": "ok"});
        assert_eq!(body.to_string(), r#"{"status":"ok"}"#);
    }
}
