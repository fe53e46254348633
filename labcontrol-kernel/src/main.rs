/**
 * LCSERVER - Point d'entrée du serveur LabControl
 *
 * RÔLE : Charger la configuration, créer les répertoires, assembler le kernel.
 * ARCHITECTURE : tracing + config YAML + Lab + routeur Axum.
 */

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use labcontrol_kernel::config::load_config;
use labcontrol_kernel::http::{build_router, AppState};
use labcontrol_kernel::Lab;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("labcontrol_kernel=info,lcserver=info")),
        )
        .init();

    let config = load_config().await.context("loading configuration")?;
    config
        .ensure_dirs()
        .await
        .context("creating lab directories")?;
    let addr = config.listen_addr.clone();
    info!(base_dir = %config.base_dir.display(), "lab data directory");

    let lab = Lab::from_config(config);
    let app = build_router(AppState::new(lab));

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "lcserver listening");
    axum::serve(listener, app).await.context("serving HTTP")?;
    Ok(())
}
