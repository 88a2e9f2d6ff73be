use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::error::DialogError;

/// Environment variable that replaces `upstream.url` after the file is read.
pub const UPSTREAM_URL_ENV: &str = "APP_OLLAMA_URL";

/// How the stage-one image travels to the inference backend.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageTransport {
    /// Base64 strings in the `images` field of the JSON body.
    #[default]
    Inline,
    /// JSON envelope in a `payload` form field next to a `file` part.
    Multipart,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    pub default_model: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub image_transport: ImageTransport,
    /// Set when `url` came from the environment rather than the file.
    #[serde(skip)]
    pub url_overridden: bool,
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_allowed_actions")]
    pub allowed_actions: Vec<String>,
    /// Largest accepted `/analyze` request body.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            allowed_actions: default_allowed_actions(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Tunables of the two-stage dialog.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DialogConfig {
    pub ask_max_tokens: u32,
    pub final_max_tokens: u32,
    /// Budget for an instruction that comes with an image.
    pub vision_max_tokens: u32,
    /// Budget for an instruction without an image.
    pub instruction_max_tokens: u32,
    /// Upper bound on clarifying questions kept from the first response.
    pub max_questions: usize,
    /// Literal that separates the description from the questions, matched case-insensitively.
    pub stage_marker: String,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            ask_max_tokens: 256,
            final_max_tokens: 512,
            vision_max_tokens: 512,
            instruction_max_tokens: 256,
            max_questions: 3,
            stage_marker: "Step 2".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub dialog: DialogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub prompts_file: PathBuf,
}

impl AppConfig {
    /// Parses YAML configuration and applies the environment override for the upstream URL.
    pub fn from_yaml(source: &str) -> Result<Self, DialogError> {
        let mut config: AppConfig = serde_yaml::from_str(source)
            .map_err(|e| DialogError::Config(format!("invalid config: {e}")))?;
        config.override_upstream_url(std::env::var(UPSTREAM_URL_ENV).ok());
        Ok(config)
    }

    /// Replaces `upstream.url` when a value is given and returns whether it did.
    ///
    /// Nothing is logged here since this runs before the logger is set up;
    /// callers report [`UpstreamConfig::url_overridden`] once it is.
    pub fn override_upstream_url(&mut self, url: Option<String>) -> bool {
        let Some(url) = url else {
            return false;
        };
        self.upstream.url = url;
        self.upstream.url_overridden = true;
        true
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DialogError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| DialogError::Config(format!("{}: {e}", path.display())))?;
        let mut config = Self::from_yaml(&source)?;

        // prompts path is relative to the config file
        if config.prompts_file.is_relative() {
            if let Some(dir) = path.parent() {
                config.prompts_file = dir.join(&config.prompts_file);
            }
        }
        Ok(config)
    }
}

fn default_timeout_seconds() -> u64 {
    120
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8000
}

fn default_allowed_actions() -> Vec<String> {
    vec!["new".to_string(), "answer".to_string()]
}

fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}
