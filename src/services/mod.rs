pub mod bch;
pub mod dash;
pub mod ethereum;
pub mod locks;
pub mod notifier;
pub mod polling;
pub mod store;

pub use bch::{BchConfirmer, BchNodeClient, BchRpc};
pub use dash::{ChainRiderClient, DashConfirmer, DashRpc};
pub use ethereum::{EthereumConfirmer, EthereumRpc, EthereumService};
pub use locks::{connect_locks, lock_key, MemoryPaymentLocks, PaymentLocks, RedisPaymentLocks};
pub use notifier::{Notifier, QueueNotifier};
pub use store::{MemoryPaymentStore, PaymentStore, PgPaymentStore};
