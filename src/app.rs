//! Service wiring: store, carriers, pipelines and the HTTP router.

use std::str::FromStr;
use std::sync::Arc;

use axum::Router;
use tokio::task::JoinHandle;
use tracing::info;

use crate::api::{AppState, routes};
use crate::config::AppConfig;
use crate::dispatch::{
    CoverSheetRenderer, DispatchLoop, DocumentRenderer, HttpRenderer, spawn_sweep_ticker,
    transport_from_config,
};
use crate::error::{ConfigError, Result};
use crate::notify::{EmailNotifier, Notifier};
use crate::store::{Database, LibSqlBackend};
use crate::triage::{TesseractEngine, TriageService};

/// A fully wired service, ready to serve.
pub struct App {
    pub router: Router,
    /// Present when `FAX_SWEEP_CRON` drives sweeps in-process.
    pub sweep_ticker: Option<JoinHandle<()>>,
}

/// Open the database and assemble every component from configuration.
pub async fn build(config: &AppConfig) -> Result<App> {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);

    let transport = transport_from_config(
        config.dispatch.transport,
        config.phaxio.clone(),
        config.srfax.clone(),
    )?;

    let renderer: Arc<dyn DocumentRenderer> = match &config.dispatch.renderer_url {
        Some(url) => Arc::new(HttpRenderer::new(url.clone())),
        None => Arc::new(CoverSheetRenderer),
    };

    let notifier: Option<Arc<dyn Notifier>> = config
        .notify
        .clone()
        .map(|n| Arc::new(EmailNotifier::new(n)) as Arc<dyn Notifier>);

    info!(
        carrier = transport.name(),
        renderer = config.dispatch.renderer_url.as_deref().unwrap_or("cover-sheet"),
        notifications = notifier.is_some(),
        "Dispatch configured"
    );

    let mut dispatch = DispatchLoop::new(
        Arc::clone(&db),
        transport,
        renderer,
        config.dispatch.claim_timeout,
    );
    if let Some(ref n) = notifier {
        dispatch = dispatch.with_notifier(Arc::clone(n));
    }
    let dispatch = Arc::new(dispatch);

    let sweep_ticker = match &config.dispatch.sweep_cron {
        Some(expr) => {
            let schedule =
                cron::Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
                    key: "FAX_SWEEP_CRON".into(),
                    message: e.to_string(),
                })?;
            info!(schedule = %expr, "In-process dispatch sweep enabled");
            Some(spawn_sweep_ticker(Arc::clone(&dispatch), schedule))
        }
        None => None,
    };

    let ocr = Arc::new(TesseractEngine::new(config.ocr_language.clone()));
    let mut triage = TriageService::new(Arc::clone(&db), ocr);
    if let Some(n) = notifier {
        triage = triage.with_notifier(n);
    }

    let router = routes(AppState {
        store: db,
        dispatch,
        triage: Arc::new(triage),
        retention_days: config.retention_days,
    });

    Ok(App {
        router,
        sweep_ticker,
    })
}
