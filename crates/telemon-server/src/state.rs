use crate::config::ServerConfig;
use crate::service::MetricService;
use ip_network::IpNetwork;
use std::sync::Arc;
use telemon_common::crypto::Decryptor;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MetricService>,
    pub hash_key: Option<Arc<[u8]>>,
    pub decryptor: Option<Arc<Decryptor>>,
    pub trusted_subnet: Option<IpNetwork>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Resolves keys and the trusted subnet from `config`.
    pub fn new(config: ServerConfig, service: MetricService) -> anyhow::Result<Self> {
        let decryptor = match &config.crypto_key {
            Some(path) => Some(Arc::new(Decryptor::from_file(path)?)),
            None => None,
        };
        Ok(Self {
            service: Arc::new(service),
            hash_key: config.hash_key().map(|k| Arc::from(k.as_bytes())),
            decryptor,
            trusted_subnet: config.trusted_subnet()?,
            config: Arc::new(config),
        })
    }
}
