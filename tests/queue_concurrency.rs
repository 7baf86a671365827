use plexcli::media::{MediaItem, MediaKind};
use plexcli::store::Queue;
use std::thread;

fn item(path: &str) -> MediaItem {
    MediaItem {
        path: path.to_string(),
        title: format!("title {path}"),
        kind: MediaKind::Movie,
        show_title: None,
        season_title: None,
        season: None,
        episode: None,
        year: None,
        duration_ms: 0,
        rating: 0.0,
        summary: String::new(),
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

#[test]
fn ten_concurrent_writers_lose_nothing() {
    let dir = tempfile::tempdir().unwrap();

    let handles: Vec<_> = (0..10)
        .map(|worker| {
            let dir = dir.path().to_path_buf();
            thread::spawn(move || {
                for i in 0..5 {
                    let path = format!("/library/metadata/{}", worker * 100 + i);
                    let added = Queue::add(&dir, &[item(&path)]).unwrap();
                    assert_eq!(added, 1, "fresh path {path} must be added exactly once");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let queue = Queue::load(dir.path()).unwrap();
    assert_eq!(queue.items.len(), 50);

    let mut paths: Vec<&str> = queue.items.iter().map(|i| i.path.as_str()).collect();
    paths.sort_unstable();
    paths.dedup();
    assert_eq!(paths.len(), 50, "all queued paths must be distinct");

    // The on-disk file is a plain JSON document.
    let raw = std::fs::read_to_string(dir.path().join("queue.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["items"].as_array().unwrap().len(), 50);
}
