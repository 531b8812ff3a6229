//! Credential service: agent auth token freshness.
//!
//! The runner consults `is_auth_error` on every terminal container error to
//! decide whether an inline refresh-and-retry is worth attempting, and a
//! proactive refresh loop keeps the token warm so containers rarely hit an
//! expired credential at all.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use courier_core::CredentialsConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};

use crate::channel::ChannelDriver;

#[async_trait]
pub trait CredentialService: Send + Sync {
    /// Refresh if the current token is missing or inside the expiry margin.
    async fn ensure_fresh(&self) -> anyhow::Result<()>;

    /// Force a refresh.
    async fn refresh(&self) -> anyhow::Result<()>;

    /// Whether an agent error message describes an auth failure.
    fn is_auth_error(&self, error_text: &str) -> bool;
}

// ---------------------------------------------------------------------------
// OAuth refresh-token flow
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CachedCredentials {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

#[derive(Default)]
struct TokenState {
    refresh_token: Option<String>,
    expires_at: Option<Instant>,
}

pub struct OauthCredentials {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    margin: Duration,
    patterns: Vec<String>,
    cache_path: PathBuf,
    state: Mutex<TokenState>,
}

impl OauthCredentials {
    pub fn new(config: &CredentialsConfig, data_dir: &std::path::Path) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            margin: Duration::from_secs(config.refresh_margin_secs),
            patterns: lowercase_patterns(&config.auth_error_patterns),
            cache_path: data_dir.join("credentials.json"),
            state: Mutex::new(TokenState::default()),
        }
    }

    fn load_refresh_token(&self) -> Option<String> {
        if let Ok(token) = std::env::var("COURIER_REFRESH_TOKEN") {
            if !token.trim().is_empty() {
                return Some(token.trim().to_string());
            }
        }
        let raw = std::fs::read_to_string(&self.cache_path).ok()?;
        let cached: CachedCredentials = serde_json::from_str(&raw).unwrap_or_default();
        cached.refresh_token
    }

    fn persist(&self, token: &TokenResponse) {
        let cached = CachedCredentials {
            access_token: Some(token.access_token.clone()),
            refresh_token: token.refresh_token.clone(),
        };
        if let Some(parent) = self.cache_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let json = serde_json::to_string(&cached).unwrap_or_else(|_| "{}".into());
        if let Err(e) = std::fs::write(&self.cache_path, json) {
            warn!(err = %e, path = %self.cache_path.display(), "failed to persist credentials");
        }
    }

    /// One refresh request with bounded exponential backoff.
    async fn refresh_with_retries(&self, refresh_token: &str) -> anyhow::Result<TokenResponse> {
        let mut backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(60);
        let max_retries = 3u32;

        for attempt in 0..=max_retries {
            match self.do_refresh(refresh_token).await {
                Ok(token) => return Ok(token),
                Err(e) => {
                    if attempt == max_retries {
                        return Err(e);
                    }
                    tracing::debug!(attempt, err = %e, "refresh attempt failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        }
        anyhow::bail!("refresh exhausted all retries")
    }

    async fn do_refresh(&self, refresh_token: &str) -> anyhow::Result<TokenResponse> {
        let resp = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .context("token refresh request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("refresh failed ({status}): {text}");
        }

        resp.json().await.context("failed to parse token response")
    }
}

#[async_trait]
impl CredentialService for OauthCredentials {
    async fn ensure_fresh(&self) -> anyhow::Result<()> {
        {
            let state = self.state.lock().await;
            if let Some(expires_at) = state.expires_at {
                if expires_at > Instant::now() + self.margin {
                    return Ok(());
                }
            }
        }
        self.refresh().await
    }

    async fn refresh(&self) -> anyhow::Result<()> {
        let refresh_token = {
            let state = self.state.lock().await;
            state.refresh_token.clone()
        }
        .or_else(|| self.load_refresh_token())
        .context("no refresh token available (COURIER_REFRESH_TOKEN or credential cache)")?;

        let token = self.refresh_with_retries(&refresh_token).await?;
        self.persist(&token);

        let mut state = self.state.lock().await;
        if let Some(ref rt) = token.refresh_token {
            state.refresh_token = Some(rt.clone());
        } else {
            state.refresh_token = Some(refresh_token);
        }
        state.expires_at = token
            .expires_in
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        info!("credentials refreshed");
        Ok(())
    }

    fn is_auth_error(&self, error_text: &str) -> bool {
        matches_any(&self.patterns, error_text)
    }
}

// ---------------------------------------------------------------------------
// Static credentials (disabled mode / tests)
// ---------------------------------------------------------------------------

pub struct StaticCredentials {
    patterns: Vec<String>,
}

impl StaticCredentials {
    pub fn new(patterns: &[String]) -> Self {
        Self {
            patterns: lowercase_patterns(patterns),
        }
    }
}

#[async_trait]
impl CredentialService for StaticCredentials {
    async fn ensure_fresh(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn refresh(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_auth_error(&self, error_text: &str) -> bool {
        matches_any(&self.patterns, error_text)
    }
}

fn lowercase_patterns(patterns: &[String]) -> Vec<String> {
    patterns.iter().map(|p| p.to_lowercase()).collect()
}

fn matches_any(patterns: &[String], error_text: &str) -> bool {
    let lowered = error_text.to_lowercase();
    patterns.iter().any(|p| lowered.contains(p.as_str()))
}

// ---------------------------------------------------------------------------
// Proactive refresh loop
// ---------------------------------------------------------------------------

/// Tick the refresh on an interval. Announces transitions to the main group:
/// "restored" after recovering from a failure, "manual re-auth" on entering
/// one.
pub async fn run_refresh_loop(
    creds: Arc<dyn CredentialService>,
    channel: Arc<dyn ChannelDriver>,
    main_jid: Option<String>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_ms = interval.as_millis(), "credential refresh loop started");
    let mut failing = false;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("credential refresh loop shutting down");
                    return;
                }
            }
        }

        match creds.refresh().await {
            Ok(()) => {
                if failing {
                    failing = false;
                    if let Some(ref jid) = main_jid {
                        let _ = channel
                            .send_message(jid, "system: credentials refreshed, services restored")
                            .await;
                    }
                }
            }
            Err(e) => {
                error!(err = %e, "proactive credential refresh failed");
                if !failing {
                    failing = true;
                    if let Some(ref jid) = main_jid {
                        let _ = channel
                            .send_message(
                                jid,
                                "system: credential refresh failed — manual re-auth may be required",
                            )
                            .await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_matching_is_case_insensitive() {
        let creds = StaticCredentials::new(&[
            "401".to_string(),
            "unauthorized".to_string(),
            "token expired".to_string(),
        ]);
        assert!(creds.is_auth_error("401 Unauthorized"));
        assert!(creds.is_auth_error("OAuth Token Expired, please re-login"));
        assert!(!creds.is_auth_error("connection refused"));
    }

    #[tokio::test]
    async fn static_credentials_always_fresh() {
        let creds = StaticCredentials::new(&[]);
        assert!(creds.ensure_fresh().await.is_ok());
        assert!(creds.refresh().await.is_ok());
        assert!(!creds.is_auth_error("anything"));
    }

    #[test]
    fn cached_credentials_roundtrip() {
        let cached = CachedCredentials {
            access_token: Some("at-1".into()),
            refresh_token: Some("rt-1".into()),
        };
        let json = serde_json::to_string(&cached).unwrap();
        let parsed: CachedCredentials = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.refresh_token.as_deref(), Some("rt-1"));
    }
}
