use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable as _;
use reqwest::StatusCode;
use roomy_bridge_core::event::RoomyEvent;
use roomy_bridge_core::id::{Did, SpaceDid};
use serde::Deserialize;
use snafu::ResultExt as _;
use tracing::debug;
use url::Url;

use crate::{
    AuthSnafu, BadUrlSnafu, EventEnvelope, HttpSnafu, LeafError, LeafResult, LeafTransport,
    RemoteProfile, StatusSnafu,
};

const LOG_TARGET: &str = "bridge::leaf";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_RETRIES: usize = 4;

/// Connection settings for a Leaf server.
#[derive(Debug, Clone)]
pub struct LeafConfig {
    pub url: Url,
    /// DID of the Leaf server itself, sent along with session creation.
    pub server_did: Did,
    /// The bridge's own AT Protocol identity.
    pub bridge_did: Did,
    pub app_password: String,
    /// AppView used for profile resolution.
    pub appview_url: Url,
}

/// JSON-over-HTTP Leaf client.
///
/// `fetch_events` and `send_events` retry transient failures with Fibonacci
/// backoff; sends are safe to retry because events carry their ULID and the
/// server deduplicates on it.
pub struct HttpLeafTransport {
    client: reqwest::Client,
    config: LeafConfig,
    access_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    access_jwt: String,
}

#[derive(Deserialize)]
struct EventsResponse {
    events: Vec<EventEnvelope>,
}

impl HttpLeafTransport {
    pub async fn connect(config: LeafConfig) -> LeafResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context(HttpSnafu)?;

        let url = config
            .url
            .join("xrpc/com.atproto.server.createSession")
            .context(BadUrlSnafu)?;

        let response = client
            .post(url)
            .json(&serde_json::json!({
                "identifier": config.bridge_did.as_str(),
                "password": config.app_password,
                "audience": config.server_did.as_str(),
            }))
            .send()
            .await
            .context(HttpSnafu)?;

        if !response.status().is_success() {
            return AuthSnafu.fail();
        }

        let session: SessionResponse = response.json().await.context(HttpSnafu)?;

        debug!(
            target: LOG_TARGET,
            url = %config.url,
            did = %config.bridge_did,
            "Leaf session established"
        );

        Ok(Self {
            client,
            config,
            access_token: session.access_jwt,
        })
    }

    fn space_events_url(&self, space: &SpaceDid) -> LeafResult<Url> {
        self.config
            .url
            .join(&format!("spaces/{space}/events"))
            .context(BadUrlSnafu)
    }

    async fn fetch_events_once(
        &self,
        space: &SpaceDid,
        start: u64,
        limit: usize,
    ) -> LeafResult<Vec<EventEnvelope>> {
        let url = self.space_events_url(space)?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .query(&[("start", start.to_string()), ("limit", limit.to_string())])
            .send()
            .await
            .context(HttpSnafu)?;

        if !response.status().is_success() {
            return StatusSnafu {
                status: response.status().as_u16(),
            }
            .fail();
        }

        let events: EventsResponse = response.json().await.context(HttpSnafu)?;
        Ok(events.events)
    }

    async fn send_events_once(&self, space: &SpaceDid, events: &[RoomyEvent]) -> LeafResult<()> {
        let url = self.space_events_url(space)?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({ "events": events }))
            .send()
            .await
            .context(HttpSnafu)?;

        if !response.status().is_success() {
            return StatusSnafu {
                status: response.status().as_u16(),
            }
            .fail();
        }
        Ok(())
    }
}

#[async_trait]
impl LeafTransport for HttpLeafTransport {
    async fn fetch_events(
        &self,
        space: &SpaceDid,
        start: u64,
        limit: usize,
    ) -> LeafResult<Vec<EventEnvelope>> {
        (|| self.fetch_events_once(space, start, limit))
            .retry(backon::FibonacciBuilder::default().with_max_times(MAX_RETRIES))
            .when(LeafError::is_transient)
            .await
    }

    async fn send_events(&self, space: &SpaceDid, events: Vec<RoomyEvent>) -> LeafResult<()> {
        (|| self.send_events_once(space, &events))
            .retry(backon::FibonacciBuilder::default().with_max_times(MAX_RETRIES))
            .when(LeafError::is_transient)
            .await
    }

    async fn resolve_profile(&self, did: &Did) -> LeafResult<Option<RemoteProfile>> {
        let url = self
            .config
            .appview_url
            .join("xrpc/app.bsky.actor.getProfile")
            .context(BadUrlSnafu)?;

        let response = self
            .client
            .get(url)
            .query(&[("actor", did.as_str())])
            .send()
            .await
            .context(HttpSnafu)?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => return Ok(None),
            status if !status.is_success() => {
                return StatusSnafu {
                    status: status.as_u16(),
                }
                .fail();
            }
            _ => {}
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ProfileResponse {
            handle: String,
            #[serde(default)]
            display_name: Option<String>,
            #[serde(default)]
            avatar: Option<String>,
        }

        let profile: ProfileResponse = response.json().await.context(HttpSnafu)?;
        Ok(Some(RemoteProfile {
            handle: profile.handle,
            display_name: profile.display_name,
            avatar: profile.avatar,
        }))
    }
}
