use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Episode,
}

/// A single indexed movie or episode. Immutable after indexing; serialised
/// as one flat object so movies and episodes share the on-disk shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub path: String,
    pub title: String,
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u32>,
    #[serde(default)]
    pub duration_ms: u64,
    /// 0.0 means the server reported no rating.
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub content_rating: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub director: String,
    #[serde(default)]
    pub cast: String,
    #[serde(default)]
    pub studio: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumb: Option<String>,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub transfer_path: String,
    #[serde(default)]
    pub view_offset_ms: u64,
    #[serde(default)]
    pub view_count: u64,
    pub server_name: String,
    pub server_url: String,
}

impl MediaItem {
    /// Numeric tail of the server metadata path, e.g. `/library/metadata/123`
    /// yields `123`. Non-numeric tails are rejected so a malformed key is
    /// never posted to the timeline endpoint.
    pub fn rating_key(&self) -> Option<&str> {
        let tail = self.path.trim_end_matches('/').rsplit('/').next()?;
        if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
            Some(tail)
        } else {
            None
        }
    }

    pub fn display_title(&self) -> String {
        match self.kind {
            MediaKind::Movie => match self.year {
                Some(year) => format!("{} ({})", self.title, year),
                None => self.title.clone(),
            },
            MediaKind::Episode => {
                let show = self.show_title.as_deref().unwrap_or("?");
                match (self.season, self.episode) {
                    (Some(s), Some(e)) => {
                        format!("{} - S{:02}E{:02} - {}", show, s, e, self.title)
                    }
                    _ => format!("{} - {}", show, self.title),
                }
            }
        }
    }

    pub fn started(&self) -> bool {
        self.view_offset_ms > 0
    }
}

/// Map a server-side absolute path of the form `/home/<user>/<remote>/<rest>`
/// to the transfer tool's `<remote>:<rest>` syntax. Anything else yields an
/// empty string, which downstream reports as "no transfer path available".
pub fn transfer_path_for(file_path: &str) -> String {
    let Some(rest) = file_path.strip_prefix("/home/") else {
        return String::new();
    };
    let Some((_user, rest)) = rest.split_once('/') else {
        return String::new();
    };
    let Some((remote, tail)) = rest.split_once('/') else {
        return String::new();
    };
    if remote.is_empty() || tail.is_empty() {
        return String::new();
    }
    format!("{}:{}", remote, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn movie(path: &str) -> MediaItem {
        MediaItem {
            path: path.to_string(),
            title: "Arrival".to_string(),
            kind: MediaKind::Movie,
            show_title: None,
            season_title: None,
            season: None,
            episode: None,
            year: Some(2016),
            duration_ms: 6_960_000,
            rating: 7.9,
            summary: String::new(),
            content_rating: "PG-13".to_string(),
            genre: "Sci-Fi".to_string(),
            director: "Denis Villeneuve".to_string(),
            cast: "Amy Adams, Jeremy Renner".to_string(),
            studio: "Paramount".to_string(),
            thumb: None,
            file_path: "/home/plex/media/movies/arrival.mkv".to_string(),
            transfer_path: String::new(),
            view_offset_ms: 0,
            view_count: 0,
            server_name: "Default Server".to_string(),
            server_url: "http://localhost:32400".to_string(),
        }
    }

    #[test]
    fn rating_key_takes_numeric_tail() {
        assert_eq!(movie("/library/metadata/5012").rating_key(), Some("5012"));
        assert_eq!(movie("/library/metadata/5012/").rating_key(), Some("5012"));
    }

    #[test]
    fn rating_key_rejects_non_numeric_tail() {
        assert_eq!(movie("/library/metadata/abc12").rating_key(), None);
        assert_eq!(movie("").rating_key(), None);
    }

    #[test]
    fn transfer_path_translation() {
        assert_eq!(
            transfer_path_for("/home/plex/media/movies/arrival.mkv"),
            "media:movies/arrival.mkv"
        );
        assert_eq!(transfer_path_for("/srv/media/arrival.mkv"), "");
        assert_eq!(transfer_path_for("/home/plex"), "");
        assert_eq!(transfer_path_for("/home/plex/media"), "");
    }

    #[test]
    fn movie_serialises_without_episode_fields() {
        let json = serde_json::to_value(movie("/library/metadata/1")).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("show_title"));
        assert!(!obj.contains_key("season"));
        assert!(!obj.contains_key("episode"));
        assert_eq!(obj["kind"], "movie");
    }

    #[test]
    fn episode_display_title() {
        let mut item = movie("/library/metadata/2");
        item.kind = MediaKind::Episode;
        item.show_title = Some("Severance".to_string());
        item.season = Some(1);
        item.episode = Some(4);
        item.title = "The You You Are".to_string();
        assert_eq!(item.display_title(), "Severance - S01E04 - The You You Are");
    }
}
