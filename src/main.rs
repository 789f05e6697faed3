use anyhow::Context;

use safe_spot::config::AppConfig;
use safe_spot::onboarding::spawn_sweep_task;
use safe_spot::server::{AppState, app_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Local overrides; absent in production.
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        eprintln!("  Required: SAFESPOT_EXTRACTION_URL, SUPABASE_URL, SUPABASE_SERVICE_ROLE_KEY");
        std::process::exit(1);
    });

    eprintln!("Safe Spot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Listening: http://{}", config.server.bind_addr);
    eprintln!("   Public URL: {}", config.server.public_url);
    eprintln!("   Extraction: {}", config.extraction.webhook_url);
    eprintln!("   Registry: {}", config.registry.project_url);
    eprintln!(
        "   Google Calendar: {}",
        if config.google.is_some() { "enabled" } else { "disabled" }
    );
    match &config.evolution {
        Some(evo) => eprintln!("   WhatsApp: {} ({})", evo.base_url, evo.instance),
        None => eprintln!("   WhatsApp: disabled"),
    }
    eprintln!(
        "   Max CV size: {} bytes ({})\n",
        config.onboarding.policy.max_bytes, config.onboarding.policy.accepted_media_type
    );

    let state = AppState::from_config(&config).context("failed to build service clients")?;
    spawn_sweep_task(state.sessions.clone());
    let app = app_router(state);

    let listener = tokio::net::TcpListener::bind(config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;
    tracing::info!(addr = %config.server.bind_addr, "Safe Spot server started");
    axum::serve(listener, app).await?;

    Ok(())
}
