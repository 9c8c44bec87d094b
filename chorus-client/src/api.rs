//! REST collaborators
//!
//! The voice session needs two things from the platform's HTTP API: a
//! fresh credential before each socket connect, and the authoritative
//! participant list for a channel the operator has not joined. Both live
//! on [`AuthClient`]; the session only sees the [`CredentialSource`]
//! trait so tests can substitute a canned token.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use chorus_common::protocol::Participant;

use crate::error::VoiceError;

/// Supplies a bearer credential for each connect attempt
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Return a credential valid for opening a signaling socket
    async fn refresh(&self) -> Result<String, VoiceError>;
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct TokenRefreshResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ParticipantsResponse {
    participants: Vec<Participant>,
}

// =============================================================================
// Auth Client
// =============================================================================

/// HTTP client for the platform API
///
/// Cheap to clone; clones share the HTTP connection pool and the stored
/// bearer token.
#[derive(Clone)]
pub struct AuthClient {
    http: Client,
    base_url: String,
    /// Current bearer token, replaced on refresh and on server push
    bearer: Arc<Mutex<String>>,
}

impl AuthClient {
    /// Create a client for the API at `base_url` holding `bearer` as the
    /// initial credential
    pub fn new(base_url: &str, bearer: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer: Arc::new(Mutex::new(bearer.to_string())),
        }
    }

    fn current_bearer(&self) -> String {
        // Held only long enough to clone, never across an await
        self.bearer
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    /// Replace the stored bearer (server-pushed refresh)
    pub fn store_bearer(&self, token: &str) {
        if let Ok(mut bearer) = self.bearer.lock() {
            *bearer = token.to_string();
        }
    }

    /// Exchange the stored bearer for a fresh access token
    ///
    /// The new token replaces the stored one and is returned for use in
    /// the socket URL.
    pub async fn refresh_credential(&self) -> Result<String, VoiceError> {
        let bearer = self.current_bearer();
        let response = self
            .http
            .post(format!("{}/token/refresh", self.base_url))
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| VoiceError::CredentialRefresh(e.to_string()))?;

        if !response.status().is_success() {
            return Err(VoiceError::CredentialRefresh(format!(
                "status {}",
                response.status()
            )));
        }

        let body: TokenRefreshResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::CredentialRefresh(e.to_string()))?;

        self.store_bearer(&body.access_token);
        Ok(body.access_token)
    }

    /// Fetch the participant list for a channel
    ///
    /// Used for channels the operator is not in; inside a session the
    /// roster is maintained from signaling messages instead.
    pub async fn channel_participants(
        &self,
        channel_id: &str,
    ) -> Result<Vec<Participant>, VoiceError> {
        let bearer = self.current_bearer();
        let response = self
            .http
            .get(format!(
                "{}/api/channels/{}/participants",
                self.base_url, channel_id
            ))
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| VoiceError::Api(e.to_string()))?;

        if !response.status().is_success() {
            return Err(VoiceError::Api(format!("status {}", response.status())));
        }

        let body: ParticipantsResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Api(e.to_string()))?;

        Ok(body.participants)
    }
}

#[async_trait]
impl CredentialSource for AuthClient {
    async fn refresh(&self) -> Result<String, VoiceError> {
        self.refresh_credential().await
    }
}

// =============================================================================
// Tests
// =============================================================================
