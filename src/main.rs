use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use dukani_api::{
    app_router,
    config::{self, AppConfig},
    db, events,
    services::payments::{
        CardPaymentGateway, DarajaGateway, PushPaymentGateway, SandboxCardGateway,
        SandboxPushGateway, StripeCardGateway,
    },
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_config = config::load_config().context("failed to load configuration")?;
    config::init_tracing(&app_config.log_level, app_config.log_json);
    info!(
        environment = %app_config.environment,
        "starting dukani-api v{}",
        env!("CARGO_PKG_VERSION")
    );

    let db = Arc::new(
        db::establish_connection_from_app_config(&app_config)
            .await
            .context("failed to connect to database")?,
    );
    if app_config.auto_migrate {
        db::setup_schema(&db)
            .await
            .context("schema bootstrap failed")?;
    }

    let (event_sender, event_rx) = events::channel(1024);
    tokio::spawn(events::process_events(event_rx));

    let (push_gateway, card_gateway) = build_gateways(&app_config);
    let config = Arc::new(app_config);
    let state = AppState::build(db, config.clone(), event_sender, push_gateway, card_gateway);

    // Periodic cache maintenance
    let cache = state.cache.clone();
    let cleanup_interval = Duration::from_secs(config.cache.cleanup_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_interval);
        loop {
            ticker.tick().await;
            cache.evict_expired();
        }
    });

    let app = app_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

fn build_gateways(
    config: &AppConfig,
) -> (Arc<dyn PushPaymentGateway>, Arc<dyn CardPaymentGateway>) {
    let push: Arc<dyn PushPaymentGateway> = if config.mpesa.sandbox {
        warn!("M-Pesa gateway running in sandbox mode; no real prompts will be sent");
        Arc::new(SandboxPushGateway::default())
    } else {
        Arc::new(DarajaGateway::new(config.mpesa.clone()))
    };

    let card: Arc<dyn CardPaymentGateway> = if config.card.sandbox {
        warn!("card gateway running in sandbox mode; no real charges will be made");
        Arc::new(SandboxCardGateway::default())
    } else {
        Arc::new(StripeCardGateway::new(config.card.clone()))
    };

    (push, card)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install ctrl-c handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => warn!("failed to install sigterm handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received sigterm, shutting down"),
    }
}
