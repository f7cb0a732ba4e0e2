use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Repository cloned at the start of every execution.
    #[serde(default)]
    pub repo_url: String,
    /// Checkout directory, relative to the data directory.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
    /// Image build context, relative to the workspace.
    #[serde(default = "default_build_context")]
    pub build_context: String,
    /// Build file location, relative to the workspace.
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    /// Built images are tagged `{image_prefix}-{execution id}`.
    #[serde(default = "default_image_prefix")]
    pub image_prefix: String,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8419
}

fn default_workspace_dir() -> String {
    "workspace".to_string()
}

fn default_build_context() -> String {
    ".".to_string()
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

fn default_image_prefix() -> String {
    "rbd-build".to_string()
}

fn default_broadcast_capacity() -> usize {
    4096
}

impl DaemonConfig {
    /// The effective data directory; bootstrap fills `data_dir` in, the
    /// current directory is only a fallback.
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Absolute path of the clone workspace.
    pub fn workspace_path(&self) -> PathBuf {
        self.resolved_data_dir().join(&self.workspace_dir)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: None,
            repo_url: String::new(),
            workspace_dir: default_workspace_dir(),
            build_context: default_build_context(),
            dockerfile: default_dockerfile(),
            image_prefix: default_image_prefix(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_config_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8419);
        assert!(config.data_dir.is_none());
        assert!(config.repo_url.is_empty());
        assert_eq!(config.workspace_dir, "workspace");
        assert_eq!(config.build_context, ".");
        assert_eq!(config.dockerfile, "Dockerfile");
        assert_eq!(config.image_prefix, "rbd-build");
        assert_eq!(config.broadcast_capacity, 4096);
    }

    #[test]
    fn test_daemon_config_serde_roundtrip() {
        let config = DaemonConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let deserialized: DaemonConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(deserialized.host, config.host);
        assert_eq!(deserialized.port, config.port);
        assert_eq!(deserialized.repo_url, config.repo_url);
        assert_eq!(deserialized.workspace_dir, config.workspace_dir);
        assert_eq!(deserialized.build_context, config.build_context);
        assert_eq!(deserialized.dockerfile, config.dockerfile);
        assert_eq!(deserialized.image_prefix, config.image_prefix);
        assert_eq!(deserialized.broadcast_capacity, config.broadcast_capacity);
    }

    #[test]
    fn test_daemon_config_partial_deserialization_empty() {
        let json = "{}";
        let config: DaemonConfig = serde_json::from_str(json).expect("deserialize");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8419);
        assert!(config.data_dir.is_none());
        assert_eq!(config.workspace_dir, "workspace");
        assert_eq!(config.broadcast_capacity, 4096);
    }

    #[test]
    fn test_daemon_config_partial_deserialization_some_fields() {
        let json = r#"{"port": 9000, "repo_url": "https://example.com/app.git"}"#;
        let config: DaemonConfig = serde_json::from_str(json).expect("deserialize");
        assert_eq!(config.host, "127.0.0.1"); // default
        assert_eq!(config.port, 9000); // overridden
        assert_eq!(config.repo_url, "https://example.com/app.git"); // overridden
        assert_eq!(config.dockerfile, "Dockerfile"); // default
    }

    #[test]
    fn test_daemon_config_with_data_dir() {
        let json = r#"{"data_dir": "/custom/path"}"#;
        let config: DaemonConfig = serde_json::from_str(json).expect("deserialize");
        assert_eq!(config.data_dir, Some(PathBuf::from("/custom/path")));
        assert_eq!(config.resolved_data_dir(), PathBuf::from("/custom/path"));
        assert_eq!(
            config.workspace_path(),
            PathBuf::from("/custom/path").join("workspace")
        );
    }

    #[test]
    fn test_daemon_config_all_fields_overridden() {
        let json = r#"{
            "host": "0.0.0.0",
            "port": 9999,
            "data_dir": "/data",
            "repo_url": "git@example.com:org/app.git",
            "workspace_dir": "checkout",
            "build_context": "deploy",
            "dockerfile": "deploy/Dockerfile",
            "image_prefix": "app-image",
            "broadcast_capacity": 8192
        }"#;
        let config: DaemonConfig = serde_json::from_str(json).expect("deserialize");
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9999);
        assert_eq!(config.data_dir, Some(PathBuf::from("/data")));
        assert_eq!(config.repo_url, "git@example.com:org/app.git");
        assert_eq!(config.workspace_dir, "checkout");
        assert_eq!(config.build_context, "deploy");
        assert_eq!(config.dockerfile, "deploy/Dockerfile");
        assert_eq!(config.image_prefix, "app-image");
        assert_eq!(config.broadcast_capacity, 8192);
    }
}
