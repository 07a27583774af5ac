use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level client configuration (loaded from nimbus.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NimbusConfig {
    pub api: ApiConfig,
    pub transfer: TransferConfig,
    pub auth: AuthConfig,
    pub crypto: CryptoConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Service base URL (e.g. https://files.example.com)
    pub base_url: String,
    /// Reject plaintext HTTP endpoints instead of warning
    pub enforce_tls: bool,
    /// User-Agent header sent with every request
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per network chunk (raised to 5 MiB for direct storage uploads)
    pub chunk_size: u64,
    /// Bytes per read/write call in the transfer drivers
    pub block_size: usize,
    /// Retry transport failures
    pub retry_enabled: bool,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Retry n waits n * this many milliseconds
    pub retry_base_delay_ms: u64,
    /// Minimum gap between progress callbacks
    pub progress_interval_ms: u64,
    /// First wait between direct-storage completion polls
    pub s3_poll_initial_ms: u64,
    /// Ceiling for a single wait between completion polls
    pub s3_poll_max_delay_ms: u64,
    /// Status requests before completion is reported as unconfirmed
    pub s3_poll_max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Minimum seconds between two credential refresh attempts
    pub refresh_cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// JSON file holding the user key pair (private half passphrase-sealed)
    pub key_pair_file: PathBuf,
    /// Key pair generation for new key pairs: "X25519-1" or "X25519-2"
    pub key_pair_version: String,
    /// Argon2id memory cost in KiB (0 = generation default)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (0 = generation default)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (0 = generation default)
    pub argon2_parallelism: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://localhost".into(),
            enforce_tls: true,
            user_agent: format!("nimbus/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 2 * 1024 * 1024,
            block_size: 64 * 1024,
            retry_enabled: true,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            progress_interval_ms: 100,
            s3_poll_initial_ms: 500,
            s3_poll_max_delay_ms: 5000,
            s3_poll_max_attempts: 20,
        }
    }
}

impl TransferConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn s3_poll_initial(&self) -> Duration {
        Duration::from_millis(self.s3_poll_initial_ms)
    }

    pub fn s3_poll_max_delay(&self) -> Duration {
        Duration::from_millis(self.s3_poll_max_delay_ms)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_cooldown_secs: 15,
        }
    }
}

impl AuthConfig {
    pub fn refresh_cooldown(&self) -> Duration {
        Duration::from_secs(self.refresh_cooldown_secs)
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key_pair_file: PathBuf::from("~/.config/nimbus/keypair.json"),
            key_pair_version: "X25519-1".into(),
            argon2_mem_cost_kib: 0,
            argon2_time_cost: 0,
            argon2_parallelism: 0,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}
