use std::sync::{Arc, OnceLock};
use std::time::Duration;

use clap::Parser as _;
use roomy_bridge::config::Opts;
use roomy_bridge::discord::gateway::{self, Handler};
use roomy_bridge::discord::serenity_api::SerenityApi;
use roomy_bridge::registry::Bridge;
use roomy_bridge::webhooks::WebhookError;
use roomy_bridge_db::BridgeDb;
use roomy_bridge_leaf::{HttpLeafTransport, LeafConfig, LeafError};
use snafu::{ResultExt as _, Snafu};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Layer as _};

pub const LOG_TARGET: &str = "bridge::main";

/// How long in-flight guild work may take to finish on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu)]
pub enum BridgeError {
    #[snafu(display("Logging initialization failed"))]
    Logging,
    #[snafu(display("Database error: {source}"))]
    Database { source: roomy_bridge_db::DbError },
    #[snafu(display("Database path error: {source}"))]
    DataDir { source: std::io::Error },
    #[snafu(display("Leaf connection failed: {source}"))]
    Leaf { source: LeafError },
    #[snafu(display("Webhook pool failed to load: {source}"))]
    Webhooks { source: WebhookError },
    #[snafu(display("Discord client error: {source}"))]
    Discord { source: serenity::Error },
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

#[snafu::report]
#[tokio::main]
async fn main() -> BridgeResult<()> {
    let opts = Opts::parse();

    init_tracing(opts.otel_endpoint.as_deref())?;

    info!(target: LOG_TARGET, leaf = %opts.leaf_url, "Starting Roomy bridge");

    let db_path = BridgeDb::mk_db_path(&opts.data_dir)
        .await
        .context(DataDirSnafu)?;
    let db = Arc::new(BridgeDb::open(db_path).await.context(DatabaseSnafu)?);

    let leaf = Arc::new(
        HttpLeafTransport::connect(LeafConfig {
            url: opts.leaf_url.clone(),
            server_did: opts.leaf_server_did.clone(),
            bridge_did: opts.bridge_did.clone(),
            app_password: opts.bridge_app_password.clone(),
            appview_url: opts.appview_url.clone(),
        })
        .await
        .context(LeafSnafu)?,
    );

    // The bridge needs the serenity Http handle, which only exists once the
    // client is built; the handler gets the bridge through a cell set below.
    let bridge_cell = Arc::new(OnceLock::new());
    let mut client = gateway::build_client(&opts.discord_token, Handler::new(bridge_cell.clone()))
        .await
        .context(DiscordSnafu)?;

    let discord = Arc::new(SerenityApi::new(client.http.clone()));
    let bridge = Bridge::new(db, discord, leaf).await.context(WebhooksSnafu)?;
    bridge_cell
        .set(bridge.clone())
        .unwrap_or_else(|_| unreachable!("Cell set exactly once"));

    bridge.resume_bindings().await;

    let shard_manager = client.shard_manager.clone();
    let gateway_task = tokio::spawn(async move {
        if let Err(err) = client.start().await {
            error!(target: LOG_TARGET, %err, "Gateway connection ended");
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!(target: LOG_TARGET, "Shutting down");

    shard_manager.shutdown_all().await;
    bridge.shutdown(SHUTDOWN_GRACE).await;
    gateway_task.abort();
    let _ = gateway_task.await;

    Ok(())
}

fn init_tracing(otel_endpoint: Option<&str>) -> BridgeResult<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .from_env_lossy();
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match otel_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .build()
                .map_err(|_| BridgeError::Logging)?;
            let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
                .with_batch_exporter(exporter)
                .build();
            let tracer = opentelemetry::trace::TracerProvider::tracer(&provider, "roomy-bridge");
            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

            tracing_subscriber::registry()
                .with(fmt_layer.with_filter(filter))
                .with(otel_layer)
                .try_init()
                .map_err(|_| BridgeError::Logging)?;
            info!(target: LOG_TARGET, endpoint, "OTLP span export enabled");
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt_layer.with_filter(filter))
                .try_init()
                .map_err(|_| BridgeError::Logging)?;
        }
    }
    Ok(())
}
