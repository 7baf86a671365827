use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

pub const APP_NAME: &str = "plexcli";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub plex_token: String,
    /// Legacy single-server URL. Kept in place after migration.
    pub plex_url: String,
    pub plex_username: String,
    pub servers: Vec<ServerEntry>,

    /// Override paths for external tools; empty means PATH lookup.
    pub mpv_path: String,
    pub rclone_path: String,
    pub fzf_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub url: String,
    pub enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plex_token: String::new(),
            plex_url: String::new(),
            plex_username: String::new(),
            servers: Vec::new(),
            mpv_path: String::new(),
            rclone_path: String::new(),
            fzf_path: String::new(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.migrate_legacy();
        Ok(config)
    }

    /// A config written before multi-server support has `plex_url` set and no
    /// server list; synthesise one enabled entry and leave `plex_url` alone.
    fn migrate_legacy(&mut self) {
        if !self.plex_url.is_empty() && self.servers.is_empty() {
            self.servers.push(ServerEntry {
                name: "Default Server".to_string(),
                url: self.plex_url.clone(),
                enabled: true,
            });
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_vec_pretty(self)?;
        crate::store::write_atomic(path, &contents)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.plex_token.is_empty() {
            return Err(Error::Config(
                "no token saved; run `plexcli login` first".to_string(),
            ));
        }
        if self.servers.is_empty() {
            return Err(Error::Config("no servers configured".to_string()));
        }
        for server in &self.servers {
            let url = Url::parse(&server.url)
                .map_err(|e| Error::Config(format!("server {}: {}", server.name, e)))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(Error::Config(format!(
                    "server {}: unsupported scheme {}",
                    server.name,
                    url.scheme()
                )));
            }
            if url.host_str().is_none() {
                return Err(Error::Config(format!(
                    "server {}: URL has no host",
                    server.name
                )));
            }
        }
        Ok(())
    }

    pub fn enabled_servers(&self) -> Vec<&ServerEntry> {
        self.servers.iter().filter(|s| s.enabled).collect()
    }

    fn config_path() -> PathBuf {
        Self::app_dir().join("config.json")
    }

    pub fn log_path() -> PathBuf {
        Self::app_dir().join("plexcli.log")
    }

    pub fn cache_dir() -> PathBuf {
        Self::app_dir().join("cache")
    }

    pub fn app_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_config_migrates_to_single_server() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"plex_token":"tok","plex_url":"http://localhost:32400"}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        config.validate().unwrap();
        let enabled = config.enabled_servers();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "Default Server");
        assert_eq!(enabled[0].url, "http://localhost:32400");
        assert_eq!(config.plex_url, "http://localhost:32400");
    }

    #[test]
    fn validate_rejects_empty_token() {
        let mut config = Config::default();
        config.servers.push(ServerEntry {
            name: "a".to_string(),
            url: "http://host:32400".to_string(),
            enabled: true,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_urls() {
        let mut config = Config {
            plex_token: "tok".to_string(),
            ..Config::default()
        };
        config.servers.push(ServerEntry {
            name: "a".to_string(),
            url: "ftp://host".to_string(),
            enabled: true,
        });
        assert!(config.validate().is_err());

        config.servers[0].url = "http://".to_string();
        assert!(config.validate().is_err());

        config.servers[0].url = "https://host:32400".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert!(config.plex_token.is_empty());
        assert!(config.servers.is_empty());
    }

    #[test]
    fn save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.plex_token = "tok".to_string();
        config.servers.push(ServerEntry {
            name: "Den".to_string(),
            url: "http://den:32400".to_string(),
            enabled: false,
        });
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.plex_token, "tok");
        assert_eq!(loaded.servers.len(), 1);
        assert!(loaded.enabled_servers().is_empty());
    }
}
