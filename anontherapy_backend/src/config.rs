use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Service configuration. Loaded from anontherapy_config.toml next to the
/// executable, with environment variables as the fallback. Missing
/// credentials degrade the owning feature to a reported error; the server
/// itself always starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // LLM configuration (OpenAI-compatible chat completions)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    // Transcript blob storage (publisher writes, aggregator reads)
    #[serde(default = "default_blob_publisher_url")]
    pub blob_publisher_url: String,
    #[serde(default = "default_blob_aggregator_url")]
    pub blob_aggregator_url: String,
    #[serde(default = "default_blob_store_epochs")]
    pub blob_store_epochs: u32,

    // Identity bindings and funding markers
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // First-login wallet funding
    #[serde(default = "default_chain_rpc_url")]
    pub chain_rpc_url: String,
    #[serde(default)]
    pub funding_api_url: Option<String>,
    #[serde(default)]
    pub funding_wallet_key: Option<String>,
    #[serde(default = "default_funding_amount")]
    pub funding_amount: u64,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8788".to_string()
}

fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_blob_publisher_url() -> String {
    "https://publisher.walrus-testnet.walrus.space".to_string()
}

fn default_blob_aggregator_url() -> String {
    "https://aggregator.walrus-testnet.walrus.space".to_string()
}

fn default_blob_store_epochs() -> u32 {
    5
}

fn default_database_path() -> String {
    "anontherapy.db".to_string()
}

fn default_chain_rpc_url() -> String {
    "https://fullnode.testnet.sui.io:443".to_string()
}

fn default_funding_amount() -> u64 {
    // 0.2 testnet tokens in base units, enough gas for a handful of saves
    200_000_000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            blob_publisher_url: default_blob_publisher_url(),
            blob_aggregator_url: default_blob_aggregator_url(),
            blob_store_epochs: default_blob_store_epochs(),
            database_path: default_database_path(),
            chain_rpc_url: default_chain_rpc_url(),
            funding_api_url: None,
            funding_wallet_key: None,
            funding_amount: default_funding_amount(),
        }
    }
}

impl ServiceConfig {
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("anontherapy_config.toml")
    }

    /// Load config from anontherapy_config.toml (next to the executable),
    /// falling back to environment variables.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<ServiceConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config.with_env_overrides();
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::default().with_env_overrides()
    }

    /// Secrets and deploy-specific settings always win from the environment.
    fn with_env_overrides(mut self) -> Self {
        if let Ok(addr) = env::var("ANONTHERAPY_BIND") {
            self.bind_addr = addr;
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm_api_url = url;
        }
        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm_model = model;
        }
        if let Ok(key) = env::var("LLM_API_KEY") {
            if !key.trim().is_empty() {
                self.llm_api_key = Some(key.trim().to_string());
            }
        }

        if let Ok(url) = env::var("BLOB_PUBLISHER_URL") {
            self.blob_publisher_url = url;
        }
        if let Ok(url) = env::var("BLOB_AGGREGATOR_URL") {
            self.blob_aggregator_url = url;
        }
        if let Ok(epochs) = env::var("BLOB_STORE_EPOCHS") {
            if let Ok(parsed) = epochs.parse() {
                self.blob_store_epochs = parsed;
            }
        }

        if let Ok(path) = env::var("ANONTHERAPY_DATABASE_PATH") {
            if !path.trim().is_empty() {
                self.database_path = path;
            }
        }

        if let Ok(url) = env::var("CHAIN_RPC_URL") {
            self.chain_rpc_url = url;
        }
        if let Ok(url) = env::var("FUNDING_API_URL") {
            if !url.trim().is_empty() {
                self.funding_api_url = Some(url.trim().to_string());
            }
        }
        if let Ok(key) = env::var("FUNDING_WALLET_KEY") {
            if !key.trim().is_empty() {
                self.funding_wallet_key = Some(key.trim().to_string());
            }
        }
        if let Ok(amount) = env::var("FUNDING_AMOUNT") {
            if let Ok(parsed) = amount.parse() {
                self.funding_amount = parsed;
            }
        }

        self
    }
}
