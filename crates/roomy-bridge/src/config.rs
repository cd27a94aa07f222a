use std::path::PathBuf;

use clap::Parser;
use roomy_bridge_core::id::Did;
use url::Url;

/// Discord <-> Roomy bridge.
///
/// All settings come from the environment in deployments; the flags exist
/// for local runs. Missing required values abort startup.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Opts {
    /// Discord bot token.
    #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true)]
    pub discord_token: String,

    /// Directory holding the bridge database.
    #[arg(long, env = "DATA_DIR")]
    pub data_dir: PathBuf,

    /// Base URL of the Leaf server hosting the Roomy spaces.
    #[arg(long, env = "LEAF_URL")]
    pub leaf_url: Url,

    /// DID of the Leaf server.
    #[arg(long, env = "LEAF_SERVER_DID")]
    pub leaf_server_did: Did,

    /// The bridge's AT Protocol identity.
    #[arg(long, env = "ATPROTO_BRIDGE_DID")]
    pub bridge_did: Did,

    /// App password for the bridge identity.
    #[arg(long, env = "ATPROTO_BRIDGE_APP_PASSWORD", hide_env_values = true)]
    pub bridge_app_password: String,

    /// AppView used for AT Protocol profile resolution.
    #[arg(long, env = "APPVIEW_URL", default_value = "https://public.api.bsky.app/")]
    pub appview_url: Url,

    /// OTLP endpoint for span export; tracing stays local when unset.
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,
}
