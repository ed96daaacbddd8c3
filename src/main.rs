use anyhow::Context;

use fax_desk::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().context("Invalid configuration")?;

    eprintln!("📠 Fax Desk v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api", config.port);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Transport: {:?}", config.dispatch.transport);
    match &config.dispatch.sweep_cron {
        Some(expr) => eprintln!("   Sweep: in-process ({expr})"),
        None => eprintln!("   Sweep: external trigger (POST /api/dispatch/sweep)"),
    }
    eprintln!(
        "   Notifications: {}",
        if config.notify.is_some() { "email" } else { "disabled" }
    );

    let app = fax_desk::app::build(&config)
        .await
        .context("Failed to start fax desk")?;

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Fax desk server started");
    axum::serve(listener, app.router).await?;

    Ok(())
}
