use crate::api::{LibraryKind, PlexClient};
use crate::config::ServerEntry;
use crate::error::{Error, Result};
use crate::media::MediaItem;
use log::{debug, info};
use tokio_util::sync::CancellationToken;

/// Emitted after each library finishes so the caller can render progress.
#[derive(Debug, Clone)]
pub struct IndexProgress {
    pub server_name: String,
    pub library_name: String,
    pub items_in_library: usize,
    pub libraries_done: usize,
    pub libraries_total: usize,
    pub servers_done: usize,
    pub servers_total: usize,
}

/// Walk every movie/show library on every enabled server, sequentially, into
/// one flat catalog. Sequential on purpose: the server is the bottleneck and
/// concurrent section fetches trip its rate limits, and the progress surface
/// relies on total-order events. Any section failure aborts the whole run so
/// a partial catalog is never persisted.
pub async fn index_all<F>(
    token: &str,
    servers: &[ServerEntry],
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<Vec<MediaItem>>
where
    F: FnMut(&IndexProgress),
{
    let enabled: Vec<&ServerEntry> = servers.iter().filter(|s| s.enabled).collect();
    let servers_total = enabled.len();
    let mut all_items = Vec::new();

    for (server_index, server) in enabled.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let client = PlexClient::new(&server.name, &server.url, token);
        let libraries: Vec<_> = client
            .list_libraries()
            .await
            .map_err(|e| Error::Index {
                server: server.name.clone(),
                section: "library list".to_string(),
                source: Box::new(e),
            })?
            .into_iter()
            .filter(|l| matches!(l.kind, LibraryKind::Movie | LibraryKind::Show))
            .collect();

        debug!("{}: {} indexable libraries", server.name, libraries.len());

        for (library_index, library) in libraries.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let items = client
                .list_section(&library.key, library.kind)
                .await
                .map_err(|e| Error::Index {
                    server: server.name.clone(),
                    section: library.title.clone(),
                    source: Box::new(e),
                })?;

            on_progress(&IndexProgress {
                server_name: server.name.clone(),
                library_name: library.title.clone(),
                items_in_library: items.len(),
                libraries_done: library_index + 1,
                libraries_total: libraries.len(),
                servers_done: server_index + 1,
                servers_total,
            });

            all_items.extend(items);
        }
    }

    info!("indexed {} items across {} servers", all_items.len(), servers_total);
    Ok(all_items)
}
