//! BlajarPlus HTTP server.
//!
//! Loads configuration, connects storage, wires the payment provider and
//! email, starts the reaper and serves the API until SIGTERM/Ctrl+C.

use blajarplus::config::{Config, PaymentProvider, StorageBackend};
use blajarplus::notify::{ConsoleEmailProvider, EmailProvider, SmtpEmailProvider};
use blajarplus::payment_gateway::{MidtransGateway, MockPaymentGateway, PaymentGateway};
use blajarplus::reaper::Reaper;
use blajarplus::server::{build_router, shutdown_signal, AppState};
use blajarplus::stores::postgres::{PgStore, PoolSettings};
use blajarplus::stores::Stores;
use blajarplus_core::environment::{Clock, SystemClock};
use blajarplus_web::handlers::health::ReadinessProbe;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blajarplus=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting BlajarPlus HTTP Server");

    let config = Config::from_env();
    info!(
        storage = ?config.database.storage,
        payment_provider = ?config.payment.provider,
        smtp = config.email.smtp.is_some(),
        "Configuration loaded"
    );
    if config.auth.expose_magic_links_for_testing {
        warn!("AUTH_EXPOSE_MAGIC_LINKS_FOR_TESTING is enabled; never use this in production");
    }

    let metrics_addr: SocketAddr =
        format!("{}:{}", config.server.metrics_host, config.server.metrics_port).parse()?;
    blajarplus::metrics::install(metrics_addr)?;
    info!(address = %metrics_addr, "Metrics exporter listening");

    // Storage
    let (stores, probes): (Stores, Vec<Arc<dyn ReadinessProbe>>) = match config.database.storage {
        StorageBackend::Memory => {
            warn!("Using in-memory storage; data is lost on restart");
            let (stores, store) = Stores::memory();
            (stores, vec![store as Arc<dyn ReadinessProbe>])
        }
        StorageBackend::Postgres => {
            info!("Connecting to database...");
            let pg = PgStore::connect(&PoolSettings {
                url: config.database.url.clone(),
                max_connections: config.database.max_connections,
                min_connections: config.database.min_connections,
                connect_timeout: Duration::from_secs(config.database.connect_timeout),
            })
            .await?;
            pg.migrate().await?;
            info!("Database connected and migrated");
            let (stores, store) = Stores::postgres(pg);
            (stores, vec![store as Arc<dyn ReadinessProbe>])
        }
    };

    // Providers
    let gateway: Arc<dyn PaymentGateway> = match config.payment.provider {
        PaymentProvider::Midtrans => {
            if config.payment.server_key.is_empty() {
                warn!("MIDTRANS_SERVER_KEY is empty; checkouts and signatures will fail");
            }
            Arc::new(MidtransGateway::new(
                config.payment.server_key.clone(),
                config.payment.production,
            ))
        }
        PaymentProvider::Mock => {
            warn!("Using the mock payment gateway");
            MockPaymentGateway::shared()
        }
    };
    let email: Arc<dyn EmailProvider> = match &config.email.smtp {
        Some(settings) => Arc::new(SmtpEmailProvider::new(settings)?),
        None => Arc::new(ConsoleEmailProvider::new()),
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let addr = config.bind_address();
    let reaper_interval = config.booking.reaper_interval();
    let auto_complete_after = config.booking.auto_complete_after();
    let state = AppState::new(config, &stores, gateway, email, Arc::clone(&clock), probes);

    let reaper = Reaper::new(
        state.bookings.clone(),
        Arc::clone(&stores.bookings),
        state.auth.clone(),
        clock,
        auto_complete_after,
    )
    .spawn(reaper_interval);
    info!(interval_secs = reaper_interval.as_secs(), "Reaper started");

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reaper.abort();
    info!("Server stopped");
    Ok(())
}
