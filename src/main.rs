use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;

use tracing::info;

use relay::{AppConfig, ApplicationServer, Logger};

// relay main - no database, everything is request scoped
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = Arc::new(AppConfig::parse());

    // init logger and sentry, guards are kept alive to flush logs and maintain sentry connection
    let _guards = Logger::init(config.cargo_env, config.sentry_dsn.clone());

    info!("logger and env prepped...");

    info!("starting relay server...");

    // serve the routes, all state lives in the shared service bundle
    ApplicationServer::serve(config)
        .await
        .context("relay server failed to start")?;

    Ok(())
}
