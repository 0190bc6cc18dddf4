use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use std::time::Duration;
use telemon_common::codec;
use telemon_common::crypto::Encryptor;
use telemon_common::error::WireError;
use telemon_common::retry::{retry_with_backoff, BACKOFF};
use telemon_common::signing::{self, HASH_HEADER};
use telemon_common::types::Metric;
use telemon_common::REAL_IP_HEADER;

use crate::config::AgentConfig;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("encoding batch: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server answered {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl SendError {
    /// Transport failures and 5xx answers are worth another attempt;
    /// anything the server rejected as malformed is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            SendError::Transport(_) => true,
            SendError::Status { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

/// Delivers a batch of metrics to the collector.
#[async_trait]
pub trait MetricSender: Send + Sync {
    async fn send(&self, batch: &[Metric]) -> Result<(), SendError>;
}

/// Posts batches to `{address}/updates/` as gzip-compressed JSON, optionally
/// RSA-encrypted and HMAC-signed.
pub struct HttpSender {
    client: reqwest::Client,
    url: String,
    hash_key: Option<Vec<u8>>,
    encryptor: Option<Encryptor>,
    real_ip: Option<String>,
    schedule: Vec<Duration>,
}

impl HttpSender {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SendError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            hash_key: None,
            encryptor: None,
            real_ip: None,
            schedule: BACKOFF.to_vec(),
        })
    }

    /// Builds a sender from agent settings, loading the public key file when
    /// one is configured.
    pub fn from_config(config: &AgentConfig) -> Result<Self, SendError> {
        let mut sender = Self::new(config.updates_url(), config.request_timeout())?;
        if let Some(key) = config.hash_key() {
            sender = sender.with_hash_key(key);
        }
        if let Some(path) = &config.crypto_key {
            sender = sender.with_encryptor(Encryptor::from_file(path)?);
        }
        if let Some(ip) = config.real_ip.as_deref().filter(|ip| !ip.is_empty()) {
            sender = sender.with_real_ip(ip);
        }
        Ok(sender)
    }

    pub fn with_hash_key(mut self, key: impl AsRef<[u8]>) -> Self {
        self.hash_key = Some(key.as_ref().to_vec());
        self
    }

    pub fn with_encryptor(mut self, encryptor: Encryptor) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn with_real_ip(mut self, ip: impl Into<String>) -> Self {
        self.real_ip = Some(ip.into());
        self
    }

    pub fn with_retry_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// JSON, then gzip, then RSA when a key is loaded.
    fn encode(&self, batch: &[Metric]) -> Result<Vec<u8>, SendError> {
        let json = serde_json::to_vec(batch)?;
        let compressed = codec::compress(&json)?;
        match &self.encryptor {
            Some(encryptor) => Ok(encryptor.encrypt(&compressed)?),
            None => Ok(compressed),
        }
    }

    async fn post(&self, body: &[u8], signature: Option<&str>) -> Result<(), SendError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, codec::GZIP)
            .body(body.to_vec());
        if let Some(signature) = signature {
            request = request.header(HASH_HEADER, signature);
        }
        if let Some(ip) = &self.real_ip {
            request = request.header(REAL_IP_HEADER, ip);
        }

        let response = request.send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Status { status, body });
        }

        // The collector signs its answers when it shares our key.
        let signature = match response.headers().get(HASH_HEADER) {
            Some(header) => Some(
                header
                    .to_str()
                    .map_err(|_| WireError::MalformedSignature)?
                    .to_string(),
            ),
            None => None,
        };
        if let (Some(key), Some(signature)) = (&self.hash_key, signature) {
            let body = response.bytes().await?;
            signing::verify(key, &body, &signature)?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetricSender for HttpSender {
    async fn send(&self, batch: &[Metric]) -> Result<(), SendError> {
        let body = self.encode(batch)?;
        let signature = self.hash_key.as_ref().map(|key| signing::sign(key, &body));
        let (body, signature) = (&body, signature.as_deref());

        retry_with_backoff(&self.schedule, SendError::is_retryable, move || async move {
            self.post(body, signature).await
        })
        .await?;
        tracing::debug!(url = %self.url, count = batch.len(), "Batch delivered");
        Ok(())
    }
}
