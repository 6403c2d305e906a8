use configs::Settings;

mod configs;
mod application;
mod app_metrics;
mod auth_endpoints;
mod download;
mod http_endpoints;
mod instagram_client;
mod instagram_url;
mod media_type;
mod pages;
mod resolver;
mod session;
mod string_util;
mod webhook;

use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let app_config = Settings::default()?;
    info!("Application config: {app_config:?}");

    application::App::start(&app_config).await
}
