//! This module contain application configuration related functionality.
//!
//! All the application configurations should be set in corresponding
//! TOML file in `config` directory.
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::fmt;
use crate::string_util::StrUtil;

const DEFAULT_CONFIG_FILE_PREFIX: &str = "./config";
const DEFAULT_CONFIG_FILE_NAME: &str = "default.toml";
const PRODUCTION_ENV: &str = "production";

fn default_config_file_path(base_path: &str) -> String {
    format!("{}/{}", base_path.trim_right_slash(), DEFAULT_CONFIG_FILE_NAME)
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpServer {
    pub port: u16
}

#[derive(Deserialize, Clone)]
pub struct InstagramCfg {
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
    /// When absent, `{app_url}/auth/callback` is used
    pub redirect_uri: Option<String>,
    /// Public base URL of this service, used for every redirect back to the UI
    pub app_url: String,
    pub oauth_url: String,
    pub token_url: String,
    /// Basic Display API host, also serves long-lived token exchange and refresh
    pub graph_url: String,
    /// Facebook Graph API host (app tokens, oEmbed)
    pub graph_api_url: String,
    pub graph_api_version: String,
    pub scopes: Vec<String>,
}

impl InstagramCfg {
    pub fn redirect_uri(&self) -> String {
        match &self.redirect_uri {
            Some(uri) if !uri.is_empty() => uri.clone(),
            _ => format!("{}/auth/callback", self.app_url.as_str().trim_right_slash()),
        }
    }

    pub fn app_url(&self) -> &str {
        self.app_url.as_str().trim_right_slash()
    }

    pub fn has_credentials(&self) -> bool {
        non_empty(&self.app_id) && non_empty(&self.app_secret)
    }

    pub fn app_secret(&self) -> Option<&str> {
        self.app_secret.as_deref().filter(|s| !s.is_empty())
    }
}

impl fmt::Debug for InstagramCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstagramCfg")
            .field("app_id", &self.app_id.as_ref().map(|s|mask_creds(s)))
            .field("app_secret", &self.app_secret.as_ref().map(|s|mask_creds(s)))
            .field("redirect_uri", &self.redirect_uri)
            .field("app_url", &self.app_url)
            .field("oauth_url", &self.oauth_url)
            .field("token_url", &self.token_url)
            .field("graph_url", &self.graph_url)
            .field("graph_api_url", &self.graph_api_url)
            .field("graph_api_version", &self.graph_api_version)
            .field("scopes", &self.scopes)
            .finish()
    }
}

#[derive(Deserialize, Clone)]
pub struct WebhookCfg {
    pub verify_token: String,
}

impl fmt::Debug for WebhookCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookCfg")
            .field("verify_token", &mask_creds(&self.verify_token))
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResolverMode {
    /// Placeholder media, no calls to Instagram
    Demo,
    /// Public post metadata via the official oEmbed endpoint
    Oembed,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResolverCfg {
    pub mode: ResolverMode,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DownloadCfg {
    pub file_max_size_bytes: u64,
    /// Host of the placeholder images served by the demo download proxy
    pub demo_base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub http_server: HttpServer,
    pub instagram: InstagramCfg,
    pub webhook: WebhookCfg,
    pub resolver: ResolverCfg,
    pub download: DownloadCfg,
    pub env: String,
    pub metrics: Metrics,
}

impl Settings {
    #[cfg(test)]
    pub fn for_env(env_name: &str) -> Result<Self, ConfigError> {
        Settings::load(Some(env_name), None)
    }

    /// This method should be used for production.
    /// It loads application configuration based on the environment variables.
    pub fn default() -> Result<Self, ConfigError> {
        Settings::load(None, None)
    }

    #[cfg(test)]
    pub fn from_dir(config_path: &str, env_name: &str) -> Result<Self, ConfigError> {
        Settings::load(Some(env_name), Some(config_path))
    }

    /// Cookies get the `Secure` attribute only in production.
    pub fn is_production(&self) -> bool {
        self.env == PRODUCTION_ENV
    }

    fn load(env_name: Option<&str>, config_path: Option<&str>) -> Result<Self, ConfigError> {

        let configs_path = config_path.map(|s|s.to_string()).unwrap_or(
            std::env::var("RUN_CONFIG_DIR").unwrap_or_else(|_| DEFAULT_CONFIG_FILE_PREFIX.to_string())
        );

        let env = env_name.map(|s|s.to_string()).unwrap_or(
            std::env::var("RUN_ENV").unwrap_or_else(|_| "local".into())
        );
        tracing::info!("Using profile: {}", &env);

        let raw_config = Config::builder()
            // Start off by merging in the "default" configuration file
            .add_source(File::with_name(&default_config_file_path(&configs_path)))
            // Add in the current environment file, Default to 'local' env
            // Note that this file is _optional_
            .add_source(
                File::with_name(&format!("{}/{}", configs_path.as_str().trim_right_slash(), env)).required(false),
            )
            // Add in settings from the environment (with a prefix of APP)
            // Eg.. `APP_INSTAGRAM__APP_SECRET=... ./target/instasave` would set the `app_secret` key
            .add_source(Environment::with_prefix("app").prefix_separator("_").separator("__"))
            .set_override("env", env)?
            .build()?;

        raw_config.try_deserialize()
    }
}

fn non_empty(v: &Option<String>) -> bool {
    v.as_deref().map(|s| !s.is_empty()).unwrap_or(false)
}

fn mask_creds(s: &str) -> String {
    if s.len() <= 2 {
        return "*".repeat(s.len());
    }
    let mut result = s.to_owned();
    result.replace_range( 2 .. s.len(), "*".repeat(s.len()-2).as_str());
    result
}
