use axum::body::Body;
use axum::http::{Request, StatusCode};
use plexcli::media::{MediaItem, MediaKind};
use plexcli::stream_server::{router, Publications, StreamManifest};
use tower::ServiceExt;

fn movie() -> MediaItem {
    MediaItem {
        path: "/library/metadata/501".to_string(),
        title: "Arrival".to_string(),
        kind: MediaKind::Movie,
        show_title: None,
        season_title: None,
        season: None,
        episode: None,
        year: Some(2016),
        duration_ms: 6_960_000,
        rating: 7.9,
        summary: "a linguist decodes an alien language".to_string(),
        content_rating: "PG-13".to_string(),
        genre: "Sci-Fi".to_string(),
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

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn manifest_endpoint_serves_publications() {
    let publications = Publications::new();
    publications
        .publish(
            movie(),
            "http://host/file?X-Plex-Token=t".to_string(),
            None,
        )
        .await;
    let app = router(publications);

    let response = app
        .oneshot(Request::builder().uri("/streams").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let manifest: StreamManifest = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(manifest.count, 1);
    assert!(manifest.streams[0].id.starts_with("stream-"));
    assert_eq!(
        manifest.streams[0].stream_url,
        "http://host/file?X-Plex-Token=t"
    );
}

#[tokio::test]
async fn health_endpoint_answers_ok() {
    let app = router(Publications::new());
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, r#"{"status":"ok"}"#);
}

#[tokio::test]
async fn index_page_lists_publications() {
    let publications = Publications::new();
    publications
        .publish(movie(), "http://host/file".to_string(), None)
        .await;
    let app = router(publications);

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let html = body_string(response).await;
    assert!(html.contains("Arrival (2016)"));
    assert!(html.contains("http://host/file"));
}

#[tokio::test]
async fn empty_manifest_has_zero_count() {
    let app = router(Publications::new());
    let response = app
        .oneshot(Request::builder().uri("/streams").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let manifest: StreamManifest = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(manifest.count, 0);
    assert!(manifest.streams.is_empty());
}
