use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pay_confirm::{
    config::Config,
    error::QueueError,
    handlers::{BchVerifier, DashVerifier, EthVerifier, PaymentProcessor, PaymentServices, Verifier},
    models::{
        BchPaymentConfirmation, Blockchain, ConfirmationRequest, DashPaymentConfirmation,
        EthPaymentConfirmation,
    },
    queue::{confirmation_queue, publish_json, QueueManager, RedisStreamBroker},
    services::*,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "pay-confirm", author, version, about = "Multi-chain payment confirmation worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume a chain's payment confirmation queue until interrupted
    Consume {
        #[arg(value_enum)]
        chain: ChainArg,
    },
    /// Enqueue a confirmation request, e.g. to replay a dropped payment
    Publish {
        #[arg(value_enum)]
        chain: ChainArg,
        /// Request body as JSON
        message: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ChainArg {
    Ethereum,
    Dash,
    Bch,
}

impl From<ChainArg> for Blockchain {
    fn from(chain: ChainArg) -> Self {
        match chain {
            ChainArg::Ethereum => Blockchain::Ethereum,
            ChainArg::Dash => Blockchain::Dash,
            ChainArg::Bch => Blockchain::BitcoinCash,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    tracing::info!("Starting pay-confirm v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {:?}", config.environment);

    match cli.command {
        Command::Consume { chain } => consume(config, chain.into()).await,
        Command::Publish { chain, message } => publish(config, chain.into(), &message).await,
    }
}

async fn consume(config: Config, chain: Blockchain) -> Result<()> {
    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let store: Arc<dyn PaymentStore> = Arc::new(PgPaymentStore::connect(&config.database_url).await?);
    let locks = connect_locks(&config.queue.redis_url).await;
    let email_broker = RedisStreamBroker::connect(
        &config.queue.redis_url,
        &config.queue.group,
        &config.queue.consumer,
    )
    .await
    .context("Failed to connect email queue")?;
    let services = PaymentServices {
        store: store.clone(),
        locks,
        notifier: Arc::new(QueueNotifier::new(Arc::new(email_broker))),
    };

    match chain {
        Blockchain::Ethereum => {
            let eth = config
                .ethereum
                .as_ref()
                .context("ETH_RPC_URL required to consume Ethereum payments")?;
            let rpc = EthereumService::new(&eth.rpc_url, eth.rpc_fallback.as_deref(), config.rpc_timeout)
                .await?;
            let confirmer = EthereumConfirmer::new(
                Arc::new(rpc),
                eth.policy,
                eth.payment_contract_address,
                eth.rtc_address,
            );
            let verifier = EthVerifier::new(confirmer, store, eth.verify_attempts, eth.retry_pause);
            run_consumer(&config, verifier, services, shutdown).await
        }
        Blockchain::Dash => {
            let dash = config
                .dash
                .as_ref()
                .context("CHAINRIDER_TOKEN required to consume Dash payments")?;
            let rpc = ChainRiderClient::new(&dash.api_url, &dash.token, config.rpc_timeout);
            let confirmer = DashConfirmer::new(Arc::new(rpc), dash.policy, dash.forward_poll_interval);
            run_consumer(&config, DashVerifier::new(confirmer), services, shutdown).await
        }
        Blockchain::BitcoinCash => {
            let bch = config
                .bch
                .as_ref()
                .context("BCH_RPC_URL required to consume Bitcoin Cash payments")?;
            let rpc = BchNodeClient::new(
                &bch.rpc_url,
                bch.rpc_user.clone(),
                bch.rpc_pass.clone(),
                config.rpc_timeout,
            );
            let confirmer = BchConfirmer::new(
                Arc::new(rpc),
                bch.policy,
                bch.deposit_address.clone(),
                bch.strict_validation,
            );
            run_consumer(&config, BchVerifier::new(confirmer), services, shutdown).await
        }
    }
}

/// Consumes until shutdown, rebuilding the broker connection whenever it drops.
async fn run_consumer<V: Verifier>(
    config: &Config,
    verifier: V,
    services: PaymentServices,
    shutdown: CancellationToken,
) -> Result<()> {
    let queue = consumer_queue::<V>();
    let processor = Arc::new(PaymentProcessor::new(verifier, services));

    while !shutdown.is_cancelled() {
        let result = match RedisStreamBroker::connect(
            &config.queue.redis_url,
            &config.queue.group,
            &config.queue.consumer,
        )
        .await
        {
            Ok(broker) => {
                let broker = broker.with_claim_idle(config.queue.claim_idle);
                QueueManager::new(Arc::new(broker), queue, config.queue.prefetch)
                    .consume(processor.clone(), shutdown.clone())
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => break,
            Err(QueueError::Reconnect) => {
                tracing::warn!(
                    queue,
                    delay_secs = config.queue.reconnect_delay.as_secs(),
                    "Broker connection lost, reconnecting"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.queue.reconnect_delay) => {}
                }
            }
            Err(e) => return Err(e).context("Queue consumer failed"),
        }
    }

    tracing::info!(queue, "Consumer stopped");
    Ok(())
}

fn consumer_queue<V: Verifier>() -> &'static str {
    confirmation_queue(V::Request::BLOCKCHAIN)
}

async fn publish(config: Config, chain: Blockchain, message: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(message).context("Message is not valid JSON")?;

    // Refuse anything the consumer would only drop as malformed
    let user = match chain {
        Blockchain::Ethereum => {
            serde_json::from_value::<EthPaymentConfirmation>(value.clone())?.user_name
        }
        Blockchain::Dash => {
            serde_json::from_value::<DashPaymentConfirmation>(value.clone())?.user_name
        }
        Blockchain::BitcoinCash => {
            serde_json::from_value::<BchPaymentConfirmation>(value.clone())?.user_name
        }
    };

    let broker = RedisStreamBroker::connect(
        &config.queue.redis_url,
        &config.queue.group,
        &config.queue.consumer,
    )
    .await?;
    let queue = confirmation_queue(chain);
    publish_json(&broker, queue, &value).await?;

    tracing::info!(queue, user = %user, "Published confirmation request");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl+c: {}", e);
        return;
    }
    tracing::info!("Shutting down gracefully...");
    shutdown.cancel();
}
