use std::{sync::Arc, time::{Duration, Instant}};

use tracing::{info, warn};

use crate::{
    app_metrics,
    configs::{ResolverMode, Settings},
    http_endpoints::{self, AppState},
    instagram_client::{GraphApiClient, InstagramApi},
    resolver::{DemoResolver, MediaResolver, OEmbedResolver},
};

pub struct App {
}

impl App {
    /// This is the main assembly point of the InstaSave service.
    /// It wires the Instagram API client and the media resolver into
    /// the HTTP server that serves both the pages and the JSON API.
    pub async fn start(app_cfg: &Settings) -> anyhow::Result<()> {
        let metrics = if app_cfg.metrics.enabled {
            Some(app_metrics::setup_metrics_recorder()?)
        } else {
            None
        };

        let timeout = Duration::from_secs(app_cfg.resolver.timeout_secs);
        let instagram: Arc<dyn InstagramApi + Send + Sync> =
            Arc::new(GraphApiClient::new(&app_cfg.instagram, timeout)?);

        let has_credentials = app_cfg.instagram.has_credentials();
        if !has_credentials {
            warn!("Instagram app id or secret is missing, login and oEmbed calls will fail");
        }
        let resolver: Arc<dyn MediaResolver + Send + Sync> = match app_cfg.resolver.mode {
            ResolverMode::Demo => Arc::new(DemoResolver),
            ResolverMode::Oembed => Arc::new(OEmbedResolver::new(instagram.clone(), has_credentials)),
        };
        info!("Using {:?} resolver", app_cfg.resolver.mode);

        let http_client = reqwest::Client::builder().timeout(timeout).build()?;

        let state = AppState {
            settings: Arc::new(app_cfg.clone()),
            instagram,
            resolver,
            http_client,
            started_at: Instant::now(),
            metrics,
        };

        http_endpoints::run_api_server(&app_cfg.http_server, state).await
    }
}
