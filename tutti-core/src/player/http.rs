//! HTTP Player Client
//!
//! Drives a locally running desktop player through its remote-control
//! REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Player, PlayerError};
use crate::session::SongId;

/// Default remote-control API port
pub const DEFAULT_PORT: u16 = 10767;

/// Default connection timeout (short since it's localhost)
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(1);

/// Default request timeout (short since it's localhost)
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Client for the local player's REST API
#[derive(Debug, Clone)]
pub struct HttpPlayer {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[allow(dead_code)]
    status: String,
    #[serde(flatten)]
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NowPlayingResponse {
    info: Option<TransportInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransportInfo {
    song_id: u64,
    position_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IsPlayingResponse {
    is_playing: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadRequest {
    song_id: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SeekRequest {
    position_ms: u64,
}

impl HttpPlayer {
    /// Create a new client with default settings (localhost:10767)
    pub fn new() -> Self {
        Self::with_port(DEFAULT_PORT)
    }

    /// Create a new client with a custom port
    pub fn with_port(port: u16) -> Self {
        let http = Client::builder()
            .connect_timeout(CONNECTION_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            // Limit connection pool to avoid stale connections
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(10))
            // Disable keep-alive to ensure fresh connections
            .tcp_keepalive(None)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            http,
            // Use 127.0.0.1 explicitly to avoid IPv6 issues
            base_url: format!("http://127.0.0.1:{}", port),
            api_token: None,
        }
    }

    /// Set the API token for authentication
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    /// Build a request with optional authentication
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/api/v1/playback{}", self.base_url, path);
        let mut req = self.http.request(method, &url);

        if let Some(token) = &self.api_token {
            req = req.header("apitoken", token);
        }

        req
    }

    /// Check that the player is running and the token is accepted
    pub async fn probe(&self) -> Result<(), PlayerError> {
        debug!("checking player connection at {}", self.base_url);

        let resp = self
            .request(reqwest::Method::GET, "/active")
            .send()
            .await
            .map_err(|e| {
                warn!("connection error: {:?}", e);
                if e.is_connect() || e.is_timeout() {
                    PlayerError::NotReachable
                } else {
                    PlayerError::Http(e)
                }
            })?;

        match resp.status().as_u16() {
            200 | 204 => Ok(()),
            401 | 403 => Err(PlayerError::Unauthorized),
            s => Err(PlayerError::Api(format!("Unexpected response (HTTP {})", s))),
        }
    }

    async fn now_playing(&self) -> Result<Option<TransportInfo>, PlayerError> {
        let resp = self
            .request(reqwest::Method::GET, "/now-playing")
            .send()
            .await?;

        // Nothing loaded yet
        if resp.status() == 404 || resp.status() == 204 {
            return Ok(None);
        }

        match resp.json::<ApiResponse<NowPlayingResponse>>().await {
            Ok(body) => Ok(body.data.info),
            Err(_) => Ok(None),
        }
    }
}

impl Default for HttpPlayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Player for HttpPlayer {
    async fn load(&self, song: SongId) -> Result<(), PlayerError> {
        let resp = self
            .request(reqwest::Method::POST, "/load")
            .json(&LoadRequest { song_id: song.0 })
            .send()
            .await?;

        // The player answers 404 when it cannot resolve a stream
        if resp.status() == 404 {
            return Err(PlayerError::Resolve(song));
        }
        resp.error_for_status()?;
        Ok(())
    }

    async fn seek(&self, position_ms: u64) -> Result<(), PlayerError> {
        self.request(reqwest::Method::POST, "/seek")
            .json(&SeekRequest { position_ms })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn play(&self) -> Result<(), PlayerError> {
        self.request(reqwest::Method::POST, "/play")
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn pause(&self) -> Result<(), PlayerError> {
        self.request(reqwest::Method::POST, "/pause")
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn position_ms(&self) -> Result<u64, PlayerError> {
        Ok(self
            .now_playing()
            .await?
            .map(|info| info.position_ms)
            .unwrap_or(0))
    }

    async fn is_playing(&self) -> Result<bool, PlayerError> {
        let resp: ApiResponse<IsPlayingResponse> = self
            .request(reqwest::Method::GET, "/is-playing")
            .send()
            .await?
            .json()
            .await?;

        Ok(resp.data.is_playing)
    }

    async fn current_song(&self) -> Result<Option<SongId>, PlayerError> {
        Ok(self
            .now_playing()
            .await?
            .map(|info| SongId(info.song_id)))
    }
}
