use std::future::IntoFuture;

use anyhow::{Context, Result};
use rollcall_core::{load_gallery, Ledger, OnnxAnalyzer};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod server;
#[cfg(test)]
mod testing;

use config::Config;
use server::{AppState, V4lOpener};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        bind = %config.bind_addr,
        camera = %config.camera_device,
        models = %config.model_dir.display(),
        "rollcalld starting"
    );

    let startup = config.clone();
    let (analyzer, gallery) = tokio::task::spawn_blocking(move || -> Result<_> {
        let mut analyzer = OnnxAnalyzer::load(&startup.model_dir)
            .with_context(|| format!("failed to load models from {}", startup.model_dir.display()))?;
        let (gallery, source) = load_gallery(
            &startup.gallery_cache,
            &startup.known_faces_dir,
            &mut analyzer,
        )
        .context("failed to load known faces")?;
        tracing::info!(entries = gallery.len(), source = ?source, "gallery loaded");
        Ok((analyzer, gallery))
    })
    .await
    .context("startup task panicked")??;

    if gallery.is_empty() {
        tracing::warn!(
            dir = %config.known_faces_dir.display(),
            "gallery is empty; every face will be labeled Unknown"
        );
    }

    let opener = V4lOpener {
        device: config.camera_device.clone(),
        width: config.frame_width,
        height: config.frame_height,
    };
    let state = AppState::new(
        opener,
        analyzer,
        gallery,
        Ledger::new(config.ledger_path.clone()),
        config.stream_settings(),
    );

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(addr = %config.bind_addr, "rollcalld ready");

    // Open video feeds never finish on their own, so shutdown does not wait for them.
    tokio::select! {
        result = axum::serve(listener, server::router(state)).into_future() => {
            result.context("HTTP server failed")?;
        }
        _ = server::shutdown_signal() => {
            tracing::info!("rollcalld shutting down");
        }
    }

    Ok(())
}
