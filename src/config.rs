use anyhow::{bail, Context, Result};
use ethers::types::Address;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Testnet,
    Production,
}

impl Environment {
    pub fn is_dev(&self) -> bool {
        !matches!(self, Environment::Production)
    }
}

/// How long and how hard a chain adapter polls before calling a payment final.
///
/// Built once at startup and handed to each adapter by value; adapters never
/// change it afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    pub required_confirmations: u64,
    pub poll_interval: Duration,
    pub deadline: Duration,
}

impl ConfirmationPolicy {
    pub fn ethereum(env: Environment) -> Self {
        Self {
            required_confirmations: if env.is_dev() { 3 } else { 30 },
            poll_interval: Duration::from_secs(15),
            deadline: Duration::from_secs(60 * 60),
        }
    }

    /// `poll_interval` is the per-missing-confirmation wait.
    pub fn dash(env: Environment) -> Self {
        Self {
            required_confirmations: if env.is_dev() { 3 } else { 6 },
            poll_interval: Duration::from_secs(2 * 60),
            deadline: Duration::from_secs(90 * 60),
        }
    }

    pub fn bitcoin_cash(env: Environment) -> Self {
        Self {
            required_confirmations: if env.is_dev() { 1 } else { 3 },
            poll_interval: if env.is_dev() {
                Duration::from_secs(5)
            } else {
                Duration::from_secs(10 * 60)
            },
            deadline: Duration::from_secs(3 * 60 * 60),
        }
    }

    /// Applies `<PREFIX>_CONFIRMATIONS`, `<PREFIX>_POLL_SECS` and
    /// `<PREFIX>_DEADLINE_SECS` overrides.
    fn with_overrides(mut self, prefix: &str) -> Result<Self> {
        if let Some(count) = optional_parse::<u64>(&format!("{}_CONFIRMATIONS", prefix))? {
            self.required_confirmations = count;
        }
        if let Some(secs) = optional_parse::<u64>(&format!("{}_POLL_SECS", prefix))? {
            self.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = optional_parse::<u64>(&format!("{}_DEADLINE_SECS", prefix))? {
            self.deadline = Duration::from_secs(secs);
        }
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct EthereumConfig {
    pub rpc_url: String,
    pub rpc_fallback: Option<String>,
    pub payment_contract_address: Address,
    pub rtc_address: Address,
    pub policy: ConfirmationPolicy,
    /// Whole-verification attempts made by the orchestrator.
    pub verify_attempts: u32,
    pub retry_pause: Duration,
}

#[derive(Debug, Clone)]
pub struct DashConfig {
    pub api_url: String,
    pub token: String,
    pub policy: ConfirmationPolicy,
    /// Wait applied while a payment forward has nothing new to process.
    pub forward_poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct BchConfig {
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_pass: Option<String>,
    pub deposit_address: String,
    pub strict_validation: bool,
    pub policy: ConfirmationPolicy,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub redis_url: String,
    pub prefetch: usize,
    pub group: String,
    pub consumer: String,
    pub reconnect_delay: Duration,
    /// Pending entries idle this long are taken over from their consumer.
    pub claim_idle: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub database_url: String,
    pub rpc_timeout: Duration,
    pub queue: QueueConfig,

    pub ethereum: Option<EthereumConfig>,
    pub dash: Option<DashConfig>,
    pub bch: Option<BchConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let environment = Self::parse_environment()?;

        let config = Self {
            environment,
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL required")?,
            rpc_timeout: Duration::from_secs(
                std::env::var("RPC_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .context("Invalid RPC_TIMEOUT_SECS")?,
            ),
            queue: Self::parse_queue()?,
            ethereum: Self::parse_ethereum(environment)?,
            dash: Self::parse_dash(environment)?,
            bch: Self::parse_bch(environment)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn parse_environment() -> Result<Environment> {
        let env = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        match env.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "testnet" | "test" => Ok(Environment::Testnet),
            "production" | "prod" => Ok(Environment::Production),
            _ => bail!("Unknown environment: {}", env),
        }
    }

    fn parse_queue() -> Result<QueueConfig> {
        Ok(QueueConfig {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            prefetch: std::env::var("QUEUE_PREFETCH")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid QUEUE_PREFETCH")?,
            group: std::env::var("QUEUE_GROUP").unwrap_or_else(|_| "pay-confirm".to_string()),
            consumer: std::env::var("QUEUE_CONSUMER").unwrap_or_else(|_| default_consumer()),
            reconnect_delay: Duration::from_secs(
                optional_parse::<u64>("QUEUE_RECONNECT_SECS")?.unwrap_or(5),
            ),
            claim_idle: Duration::from_secs(
                optional_parse::<u64>("QUEUE_CLAIM_IDLE_SECS")?.unwrap_or(600),
            ),
        })
    }

    fn parse_ethereum(env: Environment) -> Result<Option<EthereumConfig>> {
        let Ok(rpc_url) = std::env::var("ETH_RPC_URL") else {
            return Ok(None);
        };
        Ok(Some(EthereumConfig {
            rpc_url,
            rpc_fallback: std::env::var("ETH_RPC_FALLBACK").ok(),
            payment_contract_address: Self::parse_address("PAYMENT_CONTRACT_ADDRESS")?,
            rtc_address: Self::parse_address("RTC_ADDRESS")?,
            policy: ConfirmationPolicy::ethereum(env).with_overrides("ETH")?,
            verify_attempts: optional_parse("ETH_VERIFY_ATTEMPTS")?.unwrap_or(3),
            retry_pause: Duration::from_secs(optional_parse("ETH_RETRY_PAUSE_SECS")?.unwrap_or(15)),
        }))
    }

    fn parse_dash(env: Environment) -> Result<Option<DashConfig>> {
        let Ok(token) = std::env::var("CHAINRIDER_TOKEN") else {
            return Ok(None);
        };
        let network = if env.is_dev() { "testnet" } else { "main" };
        Ok(Some(DashConfig {
            api_url: std::env::var("DASH_API_URL")
                .unwrap_or_else(|_| format!("https://api.chainrider.io/v1/dash/{}", network)),
            token,
            policy: ConfirmationPolicy::dash(env).with_overrides("DASH")?,
            forward_poll_interval: Duration::from_secs(
                optional_parse("DASH_FORWARD_POLL_SECS")?.unwrap_or(4 * 60),
            ),
        }))
    }

    fn parse_bch(env: Environment) -> Result<Option<BchConfig>> {
        let Ok(rpc_url) = std::env::var("BCH_RPC_URL") else {
            return Ok(None);
        };
        Ok(Some(BchConfig {
            rpc_url,
            rpc_user: std::env::var("BCH_RPC_USER").ok(),
            rpc_pass: std::env::var("BCH_RPC_PASS").ok(),
            deposit_address: std::env::var("BCH_DEPOSIT_ADDRESS")
                .context("BCH_DEPOSIT_ADDRESS required")?,
            strict_validation: optional_parse("BCH_STRICT_VALIDATION")?.unwrap_or(false),
            policy: ConfirmationPolicy::bitcoin_cash(env).with_overrides("BCH")?,
        }))
    }

    fn parse_address(var: &str) -> Result<Address> {
        let addr_str = std::env::var(var).with_context(|| format!("{} required", var))?;
        Address::from_str(&addr_str).with_context(|| format!("Invalid address for {}", var))
    }

    fn validate(&self) -> Result<()> {
        if !self.queue.redis_url.starts_with("redis") {
            bail!("REDIS_URL must be a redis:// or rediss:// URL");
        }
        if self.queue.prefetch == 0 {
            bail!("QUEUE_PREFETCH must be at least 1");
        }
        if let Some(eth) = &self.ethereum {
            if !eth.rpc_url.starts_with("http") {
                bail!("ETH_RPC_URL must be HTTP(S) URL");
            }
            if eth.verify_attempts == 0 {
                bail!("ETH_VERIFY_ATTEMPTS must be at least 1");
            }
        }
        if let Some(dash) = &self.dash {
            if !dash.api_url.starts_with("http") {
                bail!("DASH_API_URL must be HTTP(S) URL");
            }
        }
        if let Some(bch) = &self.bch {
            if !bch.rpc_url.starts_with("http") {
                bail!("BCH_RPC_URL must be HTTP(S) URL");
            }
        }

        tracing::info!(
            "Configuration validated for {:?} environment",
            self.environment
        );

        Ok(())
    }
}

/// Stable across restarts so a restarted worker picks up its own pending list.
fn default_consumer() -> String {
    consumer_name(
        std::env::var("HOSTNAME").ok(),
        std::fs::read_to_string("/etc/hostname").ok(),
    )
}

fn consumer_name(env_host: Option<String>, file_host: Option<String>) -> String {
    [env_host, file_host]
        .into_iter()
        .flatten()
        .map(|host| host.trim().to_string())
        .find(|host| !host.is_empty())
        .unwrap_or_else(|| "pay-confirm".to_string())
}

fn optional_parse<T>(var: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid {}", var)),
        Err(_) => Ok(None),
    }
}
