use crate::error::{Error, Result};
use crate::stream_server::{StreamEntry, StreamManifest, SERVICE_TYPE};
use log::debug;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::time::Duration;

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Another instance of this tool found on the local network.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// IPv4 and IPv6 addresses flattened into one list, in the order the
    /// answers resolved.
    pub addresses: Vec<String>,
}

/// Browse for peers until `timeout` elapses. Events already delivered before
/// the deadline are drained before returning, so the peer count does not
/// depend on scheduler timing.
pub async fn discover(timeout: Duration) -> Result<Vec<Peer>> {
    let daemon = ServiceDaemon::new().map_err(|e| Error::Transport(format!("mDNS daemon: {e}")))?;
    let receiver = daemon
        .browse(SERVICE_TYPE)
        .map_err(|e| Error::Transport(format!("mDNS browse: {e}")))?;

    let deadline = tokio::time::Instant::now() + timeout;
    let mut peers: Vec<Peer> = Vec::new();

    loop {
        match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
            Err(_) => break,
            Ok(Err(_)) => break,
            Ok(Ok(event)) => handle_event(event, &mut peers),
        }
    }
    while let Ok(event) = receiver.try_recv() {
        handle_event(event, &mut peers);
    }

    let _ = daemon.stop_browse(SERVICE_TYPE);
    let _ = daemon.shutdown();
    Ok(peers)
}

fn handle_event(event: ServiceEvent, peers: &mut Vec<Peer>) {
    if let ServiceEvent::ServiceResolved(info) = event {
        let name = info.get_fullname().to_string();
        debug!("resolved peer {name}");
        let addresses: Vec<String> = info.get_addresses().iter().map(|a| a.to_string()).collect();
        match peers.iter_mut().find(|p| p.name == name) {
            Some(peer) => {
                for address in addresses {
                    if !peer.addresses.contains(&address) {
                        peer.addresses.push(address);
                    }
                }
            }
            None => peers.push(Peer {
                name,
                host: info.get_hostname().to_string(),
                port: info.get_port(),
                addresses,
            }),
        }
    }
}

/// Fetch a peer's stream manifest, trying each address in the order it
/// appeared. Networks exist where only one family routes, so IPv4 and IPv6
/// are never reordered against each other; the first 2xx wins and every
/// other attempt feeds the final error.
pub async fn fetch_streams(peer: &Peer) -> Result<Vec<StreamEntry>> {
    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .expect("HTTP client");

    let mut failures = Vec::new();
    for address in &peer.addresses {
        let url = format!("http://{}:{}/streams", bracket(address), peer.port);
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let manifest: StreamManifest = resp.json().await?;
                return Ok(manifest.streams);
            }
            Ok(resp) => failures.push(format!("{url}: HTTP {}", resp.status())),
            Err(e) => failures.push(format!("{url}: {e}")),
        }
    }
    Err(Error::Transport(format!(
        "no address of {} answered: {}",
        peer.name,
        failures.join("; ")
    )))
}

/// Literal IPv6 addresses need brackets inside a URL authority.
fn bracket(address: &str) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{address}]")
    } else {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv6_literals_are_bracketed() {
        assert_eq!(bracket("192.168.1.5"), "192.168.1.5");
        assert_eq!(bracket("fe80::1"), "[fe80::1]");
        assert_eq!(bracket("[fe80::1]"), "[fe80::1]");
    }

    #[tokio::test]
    async fn fetch_with_no_addresses_reports_transport_error() {
        let peer = Peer {
            name: "ghost._goplexcli._tcp.local.".to_string(),
            host: "ghost.local.".to_string(),
            port: 8765,
            addresses: Vec::new(),
        };
        let err = fetch_streams(&peer).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn manifest_wire_format_parses() {
        let body = r#"{"streams":[{"id":"stream-1","title":"Arrival (2016)","type":"movie",
            "year":2016,"duration":6960000,"summary":"","stream_url":"http://host/file?X-Plex-Token=t",
            "poster_url":null,"published_at":"2026-08-01T12:00:00Z"}],"count":1}"#;
        let manifest: StreamManifest = serde_json::from_str(body).unwrap();
        assert_eq!(manifest.count, 1);
        assert_eq!(
            manifest.streams[0].stream_url,
            "http://host/file?X-Plex-Token=t"
        );
    }
}
