use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::from_env();
    tracing::info!(
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        camera = %config.camera_id,
        threshold = config.match_threshold,
        margin = config.match_margin,
        confirm_matches = config.confirm_matches,
        confirm_window_ms = config.confirm_window_ms,
        sample_every = config.sample_every,
        "configuration loaded"
    );

    let engine = engine::spawn_engine(&config)?;

    tracing::info!("rollcalld ready; frames are accepted via the engine handle");

    // The transport layer (out of scope here) drives the handle:
    // start_session / submit_frame / end_session / enroll / revoke.
    tokio::signal::ctrl_c().await?;

    // Close any open session so partial evidence is not left dangling.
    match engine.end_session().await {
        Ok(Some(session)) => {
            tracing::info!(
                session = %session.id,
                attended = session.attended_count(),
                "session closed on shutdown"
            );
        }
        Ok(None) => {}
        Err(err) => tracing::warn!(error = %err, "failed to close session on shutdown"),
    }

    tracing::info!("rollcalld shutting down");
    Ok(())
}
