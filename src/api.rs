//! Client for the Plex cloud identity service and for individual media
//! servers. Library responses are loosely typed, so section parsing goes
//! field by field: anything missing or of the wrong JSON type degrades to
//! absent with a warning instead of failing the request.

use crate::error::{Error, Result};
use crate::media::{transfer_path_for, MediaItem, MediaKind};
use log::{debug, info, warn};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::config::APP_NAME;

const PLEX_TV: &str = "https://plex.tv";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const TIMELINE_TIMEOUT: Duration = Duration::from_secs(5);

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert("X-Plex-Client-Identifier", HeaderValue::from_static(APP_NAME));
    headers.insert("X-Plex-Product", HeaderValue::from_static(APP_NAME));
    headers.insert(
        "X-Plex-Version",
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    headers
}

fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .user_agent(concat!("plexcli/", env!("CARGO_PKG_VERSION")))
        .default_headers(default_headers())
        .timeout(timeout)
        .build()
        .expect("HTTP client")
}

#[derive(Debug, Clone)]
pub struct ServerRecord {
    pub name: String,
    pub owned: bool,
    /// Candidate base URLs, preferred first.
    pub connections: Vec<Connection>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub uri: String,
    pub local: bool,
}

impl ServerRecord {
    pub fn preferred_url(&self) -> Option<&str> {
        self.connections.first().map(|c| c.uri.as_str())
    }
}

/// Sign in against the cloud identity service and assemble one record per
/// device that provides a media server.
pub async fn authenticate(username: &str, password: &str) -> Result<(String, Vec<ServerRecord>)> {
    let client = build_client(HTTP_TIMEOUT);

    let response = client
        .post(format!("{}/users/sign_in.json", PLEX_TV))
        .form(&[("user[login]", username), ("user[password]", password)])
        .send()
        .await?;

    let status = response.status();
    if status.is_client_error() {
        return Err(Error::AuthFailed(format!(
            "identity service rejected credentials ({status})"
        )));
    }
    if !status.is_success() {
        return Err(Error::Transport(format!("sign-in returned {status}")));
    }

    let body: SignInResponse = response.json().await?;
    let token = body.user.auth_token;
    if token.is_empty() {
        return Err(Error::AuthFailed("empty token in sign-in response".into()));
    }
    info!("Signed in as {}", body.user.username);

    let servers = fetch_server_records(&client, &token).await?;
    Ok((token, servers))
}

async fn fetch_server_records(client: &Client, token: &str) -> Result<Vec<ServerRecord>> {
    let resources: Vec<Resource> = client
        .get(format!("{}/api/v2/resources", PLEX_TV))
        .query(&[
            ("includeHttps", "1"),
            ("includeRelay", "1"),
            ("X-Plex-Token", token),
        ])
        .send()
        .await?
        .error_for_status()
        .map_err(|e| Error::Transport(e.to_string()))?
        .json()
        .await?;

    let servers: Vec<ServerRecord> = resources
        .into_iter()
        .filter(|r| r.provides.split(',').any(|p| p == "server"))
        .map(|r| {
            info!("Server: {} ({} connections)", r.name, r.connections.len());
            ServerRecord {
                name: r.name,
                owned: r.owned,
                connections: order_connections(
                    r.connections
                        .into_iter()
                        .map(|c| Connection {
                            uri: c.uri,
                            local: c.local,
                        })
                        .collect(),
                ),
            }
        })
        .collect();

    if servers.is_empty() {
        return Err(Error::NoServers);
    }
    Ok(servers)
}

/// Server-returned order is preserved except that the first local connection
/// is promoted to the preferred slot.
fn order_connections(mut connections: Vec<Connection>) -> Vec<Connection> {
    if let Some(pos) = connections.iter().position(|c| c.local) {
        let local = connections.remove(pos);
        connections.insert(0, local);
    }
    connections
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryKind {
    Movie,
    Show,
    Other,
}

#[derive(Debug, Clone)]
pub struct Library {
    pub key: String,
    pub title: String,
    pub kind: LibraryKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineState {
    Playing,
    Paused,
    Stopped,
}

impl TimelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            TimelineState::Playing => "playing",
            TimelineState::Paused => "paused",
            TimelineState::Stopped => "stopped",
        }
    }
}

/// Client bound to one media server.
#[derive(Clone)]
pub struct PlexClient {
    http: Client,
    /// Dedicated short-timeout client so a stalled server cannot block the
    /// tracker tick.
    timeline_http: Client,
    pub server_name: String,
    base_url: String,
    token: String,
}

impl PlexClient {
    pub fn new(server_name: &str, base_url: &str, token: &str) -> Self {
        Self {
            http: build_client(HTTP_TIMEOUT),
            timeline_http: build_client(TIMELINE_TIMEOUT),
            server_name: server_name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Connectivity check; any non-2xx is fatal.
    pub async fn test(&self) -> Result<()> {
        let status = self
            .http
            .get(format!("{}/identity", self.base_url))
            .query(&[("X-Plex-Token", self.token.as_str())])
            .send()
            .await?
            .status();
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "{}: identity returned {status}",
                self.server_name
            )));
        }
        Ok(())
    }

    pub async fn list_libraries(&self) -> Result<Vec<Library>> {
        let body = self
            .get_json(&format!("{}/library/sections", self.base_url), &[])
            .await?;

        let mut libraries = Vec::new();
        for section in container_entries(&body, "Directory") {
            let Some(key) = opt_str(section, "key", "library section") else {
                warn!("library section without a key, skipping");
                continue;
            };
            let title = opt_str(section, "title", "library section").unwrap_or_default();
            let kind = match opt_str(section, "type", "library section").as_deref() {
                Some("movie") => LibraryKind::Movie,
                Some("show") => LibraryKind::Show,
                _ => LibraryKind::Other,
            };
            libraries.push(Library { key, title, kind });
        }
        Ok(libraries)
    }

    /// Fetch every watchable item in a section. Show sections are requested
    /// with `type=4` so the response carries episodes directly instead of
    /// show aggregates; one call replaces the show → season → episode walk.
    pub async fn list_section(&self, key: &str, kind: LibraryKind) -> Result<Vec<MediaItem>> {
        let media_kind = match kind {
            LibraryKind::Movie => MediaKind::Movie,
            LibraryKind::Show => MediaKind::Episode,
            LibraryKind::Other => {
                return Err(Error::Protocol(format!(
                    "section {key} is neither movie nor show"
                )))
            }
        };

        let url = format!("{}/library/sections/{}/all", self.base_url, key);
        let query: &[(&str, &str)] = match media_kind {
            MediaKind::Movie => &[],
            MediaKind::Episode => &[("type", "4")],
        };
        let body = self.get_json(&url, query).await?;

        Ok(parse_section(
            &body,
            media_kind,
            &self.server_name,
            &self.base_url,
        ))
    }

    /// Resolve the direct stream URL for an item: its first media part's key,
    /// with a download flag and the token appended.
    pub async fn stream_url(&self, item_path: &str) -> Result<String> {
        let url = format!("{}{}", self.base_url, item_path);
        let body = match self.get_json(&url, &[]).await {
            Err(Error::SectionGone) => return Err(Error::NotFound(item_path.to_string())),
            other => other?,
        };

        let part_key = container_entries(&body, "Metadata")
            .first()
            .and_then(|meta| meta.get("Media"))
            .and_then(|m| m.get(0))
            .and_then(|m| m.get("Part"))
            .and_then(|p| p.get(0))
            .and_then(|p| p.get("key"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let key = match part_key {
            Some(k) => k,
            None => {
                warn!("{item_path}: no media part key, falling back to the item path");
                item_path.to_string()
            }
        };
        Ok(compose_stream_url(&self.base_url, &self.token, &key))
    }

    /// Inform the server of playback state. Failures are logged and
    /// swallowed so a stalled timeline endpoint never interrupts playback.
    pub async fn update_timeline(
        &self,
        rating_key: &str,
        state: TimelineState,
        time_ms: u64,
        duration_ms: u64,
    ) {
        let time = time_ms.to_string();
        let duration = duration_ms.to_string();
        let metadata_key = format!("/library/metadata/{rating_key}");
        let result = self
            .timeline_http
            .get(format!("{}/:/timeline", self.base_url))
            .query(&[
                ("ratingKey", rating_key),
                ("key", metadata_key.as_str()),
                ("state", state.as_str()),
                ("time", time.as_str()),
                ("duration", duration.as_str()),
                ("X-Plex-Token", self.token.as_str()),
            ])
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!("timeline {} {} @ {}ms", rating_key, state.as_str(), time_ms);
            }
            Ok(resp) => warn!("timeline update returned {}", resp.status()),
            Err(e) => warn!("timeline update failed: {e}"),
        }
    }

    async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value> {
        let response = self
            .http
            .get(url)
            .query(query)
            .query(&[("X-Plex-Token", self.token.as_str())])
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(Error::AuthExpired),
            StatusCode::NOT_FOUND => Err(Error::SectionGone),
            status if !status.is_success() => {
                Err(Error::Transport(format!("{url} returned {status}")))
            }
            _ => Ok(response.json().await?),
        }
    }
}

pub fn compose_stream_url(base_url: &str, token: &str, part_key: &str) -> String {
    format!("{base_url}{part_key}?download=1&X-Plex-Token={token}")
}

fn container_entries<'a>(body: &'a Value, key: &str) -> Vec<&'a Value> {
    body.get("MediaContainer")
        .and_then(|c| c.get(key))
        .and_then(Value::as_array)
        .map(|a| a.iter().collect())
        .unwrap_or_default()
}

/// Flatten one section response into catalog entries. Items without the
/// opaque server path are skipped with a warning; every other field
/// degrades to absent on mismatch.
fn parse_section(
    body: &Value,
    kind: MediaKind,
    server_name: &str,
    base_url: &str,
) -> Vec<MediaItem> {
    let mut items = Vec::new();
    for meta in container_entries(body, "Metadata") {
        if let Some(item) = parse_item(meta, kind, server_name, base_url) {
            items.push(item);
        }
    }
    items
}

fn parse_item(
    meta: &Value,
    kind: MediaKind,
    server_name: &str,
    base_url: &str,
) -> Option<MediaItem> {
    let Some(path) = opt_str(meta, "key", "item") else {
        warn!("item without a key in section response, skipping");
        return None;
    };
    let title = opt_str(meta, "title", &path).unwrap_or_default();
    if title.is_empty() {
        debug!("{path}: missing title");
    }

    let (show_title, season_title, season, episode) = match kind {
        MediaKind::Movie => (None, None, None, None),
        MediaKind::Episode => {
            let show = opt_str(meta, "grandparentTitle", &path);
            let season = opt_u32(meta, "parentIndex", &path);
            let episode = opt_u32(meta, "index", &path);
            if show.as_deref().unwrap_or("").is_empty() || season.is_none() || episode.is_none() {
                warn!("{path}: episode missing show title or indices, skipping");
                return None;
            }
            (show, opt_str(meta, "parentTitle", &path), season, episode)
        }
    };

    let duration_ms = opt_u64(meta, "duration", &path).unwrap_or(0);
    let mut view_offset_ms = opt_u64(meta, "viewOffset", &path).unwrap_or(0);
    if duration_ms > 0 && view_offset_ms > duration_ms {
        view_offset_ms = duration_ms;
    }

    let file_path = meta
        .get("Media")
        .and_then(|m| m.get(0))
        .and_then(|m| m.get("Part"))
        .and_then(|p| p.get(0))
        .and_then(|p| p.get("file"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Some(MediaItem {
        transfer_path: transfer_path_for(&file_path),
        path,
        title,
        kind,
        show_title,
        season_title,
        season,
        episode,
        year: opt_u32(meta, "year", "item"),
        duration_ms,
        rating: opt_f64(meta, "rating", "item").unwrap_or(0.0),
        summary: opt_str(meta, "summary", "item").unwrap_or_default(),
        content_rating: opt_str(meta, "contentRating", "item").unwrap_or_default(),
        genre: tag_list(meta, "Genre"),
        director: tag_list(meta, "Director"),
        cast: tag_list(meta, "Role"),
        studio: opt_str(meta, "studio", "item").unwrap_or_default(),
        thumb: opt_str(meta, "thumb", "item"),
        file_path,
        view_offset_ms,
        view_count: opt_u64(meta, "viewCount", "item").unwrap_or(0),
        server_name: server_name.to_string(),
        server_url: base_url.to_string(),
    })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn opt_str(meta: &Value, key: &str, ctx: &str) -> Option<String> {
    match meta.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            warn!("{ctx}: field {key} is {}, expected string", json_type(other));
            None
        }
    }
}

fn opt_u64(meta: &Value, key: &str, ctx: &str) -> Option<u64> {
    match meta.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => n.as_u64(),
        Some(other) => {
            warn!("{ctx}: field {key} is {}, expected number", json_type(other));
            None
        }
    }
}

fn opt_u32(meta: &Value, key: &str, ctx: &str) -> Option<u32> {
    opt_u64(meta, key, ctx).and_then(|n| u32::try_from(n).ok())
}

fn opt_f64(meta: &Value, key: &str, ctx: &str) -> Option<f64> {
    match meta.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => n.as_f64(),
        Some(other) => {
            warn!("{ctx}: field {key} is {}, expected number", json_type(other));
            None
        }
    }
}

/// Joins `[{"tag": "..."}]` arrays into one comma-separated string.
fn tag_list(meta: &Value, key: &str) -> String {
    meta.get(key)
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(|t| t.get("tag").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default()
}

#[derive(Deserialize)]
struct SignInResponse {
    user: SignInUser,
}

#[derive(Deserialize)]
struct SignInUser {
    #[serde(rename = "authToken", default)]
    auth_token: String,
    #[serde(default)]
    username: String,
}

#[derive(Deserialize)]
struct Resource {
    name: String,
    provides: String,
    #[serde(default)]
    owned: bool,
    #[serde(default)]
    connections: Vec<ResourceConnection>,
}

#[derive(Deserialize)]
struct ResourceConnection {
    uri: String,
    #[serde(default)]
    local: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_local_connection_is_promoted() {
        let ordered = order_connections(vec![
            Connection {
                uri: "https://relay.example".to_string(),
                local: false,
            },
            Connection {
                uri: "http://192.168.1.10:32400".to_string(),
                local: true,
            },
            Connection {
                uri: "http://10.0.0.2:32400".to_string(),
                local: true,
            },
        ]);
        let uris: Vec<_> = ordered.iter().map(|c| c.uri.as_str()).collect();
        assert_eq!(
            uris,
            [
                "http://192.168.1.10:32400",
                "https://relay.example",
                "http://10.0.0.2:32400"
            ]
        );
    }

    #[test]
    fn parse_section_skips_items_without_key() {
        let body = json!({"MediaContainer": {"Metadata": [
            {"title": "No Key Here"},
            {"key": "/library/metadata/10", "title": "Kept"},
        ]}});
        let items = parse_section(&body, MediaKind::Movie, "srv", "http://srv:32400");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].path, "/library/metadata/10");
        assert_eq!(items[0].title, "Kept");
    }

    #[test]
    fn wrong_typed_fields_degrade_to_absent() {
        let body = json!({"MediaContainer": {"Metadata": [{
            "key": "/library/metadata/11",
            "title": "Odd Types",
            "year": "2016",
            "rating": "high",
            "duration": 120000,
        }]}});
        let items = parse_section(&body, MediaKind::Movie, "srv", "http://srv:32400");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].year, None);
        assert_eq!(items[0].rating, 0.0);
        assert_eq!(items[0].duration_ms, 120_000);
    }

    #[test]
    fn episode_without_indices_is_skipped() {
        let body = json!({"MediaContainer": {"Metadata": [
            {"key": "/library/metadata/20", "title": "Orphan", "grandparentTitle": "Show"},
            {"key": "/library/metadata/21", "title": "Kept", "grandparentTitle": "Show",
             "parentTitle": "Season 1", "parentIndex": 1, "index": 4},
        ]}});
        let items = parse_section(&body, MediaKind::Episode, "srv", "http://srv:32400");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].show_title.as_deref(), Some("Show"));
        assert_eq!(items[0].season, Some(1));
        assert_eq!(items[0].episode, Some(4));
    }

    #[test]
    fn movie_parse_fills_file_and_transfer_paths() {
        let body = json!({"MediaContainer": {"Metadata": [{
            "key": "/library/metadata/30",
            "title": "Arrival",
            "viewOffset": 9_000_000,
            "duration": 6_960_000,
            "Genre": [{"tag": "Sci-Fi"}, {"tag": "Drama"}],
            "Media": [{"Part": [{"file": "/home/plex/media/movies/arrival.mkv"}]}],
        }]}});
        let items = parse_section(&body, MediaKind::Movie, "srv", "http://srv:32400");
        assert_eq!(items[0].file_path, "/home/plex/media/movies/arrival.mkv");
        assert_eq!(items[0].transfer_path, "media:movies/arrival.mkv");
        assert_eq!(items[0].genre, "Sci-Fi, Drama");
        // Offset past the end clamps to the duration.
        assert_eq!(items[0].view_offset_ms, 6_960_000);
    }

    #[test]
    fn stream_url_composition() {
        assert_eq!(
            compose_stream_url("http://srv:32400", "tok", "/library/parts/5/file.mkv"),
            "http://srv:32400/library/parts/5/file.mkv?download=1&X-Plex-Token=tok"
        );
    }
}
