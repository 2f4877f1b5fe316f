use crate::{
    error::StoreError,
    models::{Blockchain, Payment, PaymentMethod, User},
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Persistence operations the confirmation workflow depends on.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn find_payment_by_number(
        &self,
        user_name: &str,
        number: i64,
    ) -> Result<Option<Payment>, StoreError>;

    async fn find_payment_by_tx_hash(&self, tx_hash: &str) -> Result<Option<Payment>, StoreError>;

    /// Flips `confirmed` from false to true. Returns false when another
    /// caller already did, so exactly one caller wins.
    async fn confirm_payment(&self, tx_hash: &str) -> Result<bool, StoreError>;

    /// Returns the new balance.
    async fn add_credits(&self, user_name: &str, amount: Decimal) -> Result<Decimal, StoreError>;

    async fn find_eth_address_by_user_name(
        &self,
        user_name: &str,
    ) -> Result<Option<String>, StoreError>;

    async fn find_user_by_name(&self, user_name: &str) -> Result<Option<User>, StoreError>;
}

pub struct PgPaymentStore {
    pool: PgPool,
}

impl PgPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("Connected to payment database");
        Ok(Self::new(pool))
    }

    fn payment_from_row(row: &PgRow) -> Result<Payment, StoreError> {
        let blockchain: String = row.try_get("blockchain")?;
        let method: i16 = row.try_get("payment_method")?;
        Ok(Payment {
            number: row.try_get("number")?,
            user_name: row.try_get("user_name")?,
            tx_hash: row.try_get("tx_hash")?,
            blockchain: blockchain.parse::<Blockchain>().map_err(StoreError::Corrupt)?,
            payment_method: PaymentMethod::try_from(method).map_err(StoreError::Corrupt)?,
            charge_amount: row.try_get("charge_amount")?,
            usd_value: row.try_get("usd_value")?,
            confirmed: row.try_get("confirmed")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

const PAYMENT_COLUMNS: &str = "number, user_name, tx_hash, blockchain, payment_method, \
     charge_amount, usd_value, confirmed, created_at";

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn find_payment_by_number(
        &self,
        user_name: &str,
        number: i64,
    ) -> Result<Option<Payment>, StoreError> {
        let sql = format!(
            "SELECT {} FROM payments WHERE user_name = $1 AND number = $2",
            PAYMENT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(user_name)
            .bind(number)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::payment_from_row).transpose()
    }

    async fn find_payment_by_tx_hash(&self, tx_hash: &str) -> Result<Option<Payment>, StoreError> {
        let sql = format!("SELECT {} FROM payments WHERE tx_hash = $1", PAYMENT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(tx_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::payment_from_row).transpose()
    }

    async fn confirm_payment(&self, tx_hash: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET confirmed = TRUE
            WHERE tx_hash = $1 AND confirmed = FALSE
            "#,
        )
        .bind(tx_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn add_credits(&self, user_name: &str, amount: Decimal) -> Result<Decimal, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE users
            SET credits = credits + $2
            WHERE user_name = $1
            RETURNING credits
            "#,
        )
        .bind(user_name)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::UnknownUser(user_name.to_string()))?;

        Ok(row.try_get("credits")?)
    }

    async fn find_eth_address_by_user_name(
        &self,
        user_name: &str,
    ) -> Result<Option<String>, StoreError> {
        let address: Option<Option<String>> =
            sqlx::query_scalar("SELECT eth_address FROM users WHERE user_name = $1")
                .bind(user_name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(address.flatten().filter(|a| !a.is_empty()))
    }

    async fn find_user_by_name(&self, user_name: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            "SELECT user_name, email_address, email_enabled, credits FROM users WHERE user_name = $1",
        )
        .bind(user_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok::<_, StoreError>(User {
                user_name: row.try_get("user_name")?,
                email_address: row.try_get("email_address")?,
                email_enabled: row.try_get("email_enabled")?,
                credits: row.try_get("credits")?,
            })
        })
        .transpose()
    }
}

#[derive(Default)]
struct MemoryState {
    payments: HashMap<(String, i64), Payment>,
    users: HashMap<String, User>,
    eth_addresses: HashMap<String, String>,
}

/// In-process store for tests and local runs without PostgreSQL.
#[derive(Default)]
pub struct MemoryPaymentStore {
    state: RwLock<MemoryState>,
}

impl MemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_payment(&self, payment: Payment) {
        let mut state = self.state.write().await;
        state
            .payments
            .insert((payment.user_name.clone(), payment.number), payment);
    }

    pub async fn insert_user(&self, user: User, eth_address: Option<String>) {
        let mut state = self.state.write().await;
        if let Some(address) = eth_address {
            state.eth_addresses.insert(user.user_name.clone(), address);
        }
        state.users.insert(user.user_name.clone(), user);
    }
}

#[async_trait]
impl PaymentStore for MemoryPaymentStore {
    async fn find_payment_by_number(
        &self,
        user_name: &str,
        number: i64,
    ) -> Result<Option<Payment>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .payments
            .get(&(user_name.to_string(), number))
            .cloned())
    }

    async fn find_payment_by_tx_hash(&self, tx_hash: &str) -> Result<Option<Payment>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .payments
            .values()
            .find(|p| p.tx_hash == tx_hash)
            .cloned())
    }

    async fn confirm_payment(&self, tx_hash: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state
            .payments
            .values_mut()
            .find(|p| p.tx_hash == tx_hash && !p.confirmed)
        {
            Some(payment) => {
                payment.confirmed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn add_credits(&self, user_name: &str, amount: Decimal) -> Result<Decimal, StoreError> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(user_name)
            .ok_or_else(|| StoreError::UnknownUser(user_name.to_string()))?;
        user.credits += amount;
        Ok(user.credits)
    }

    async fn find_eth_address_by_user_name(
        &self,
        user_name: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self.state.read().await.eth_addresses.get(user_name).cloned())
    }

    async fn find_user_by_name(&self, user_name: &str) -> Result<Option<User>, StoreError> {
        Ok(self.state.read().await.users.get(user_name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;

    fn payment(number: i64, tx_hash: &str) -> Payment {
        Payment {
            number,
            user_name: "alice".to_string(),
            tx_hash: tx_hash.to_string(),
            blockchain: Blockchain::Ethereum,
            payment_method: PaymentMethod::Native,
            charge_amount: Decimal::new(5, 2),
            usd_value: Decimal::from(20),
            confirmed: false,
            created_at: Utc::now(),
        }
    }

    fn alice() -> User {
        User {
            user_name: "alice".to_string(),
            email_address: "alice@example.com".to_string(),
            email_enabled: true,
            credits: Decimal::ZERO,
        }
    }

    #[tokio::test]
    async fn confirm_flips_exactly_once_under_contention() {
        let store = Arc::new(MemoryPaymentStore::new());
        store.insert_payment(payment(1, "0xabc")).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.confirm_payment("0xabc").await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(store
            .find_payment_by_number("alice", 1)
            .await
            .unwrap()
            .unwrap()
            .confirmed);
    }

    #[tokio::test]
    async fn lookups_by_number_and_hash() {
        let store = MemoryPaymentStore::new();
        store.insert_payment(payment(7, "0xdef")).await;

        assert!(store.find_payment_by_number("bob", 7).await.unwrap().is_none());
        let by_hash = store.find_payment_by_tx_hash("0xdef").await.unwrap().unwrap();
        assert_eq!(by_hash.number, 7);
        assert!(!store.confirm_payment("0xmissing").await.unwrap());
    }

    #[tokio::test]
    async fn credits_accumulate_and_unknown_user_errors() {
        let store = MemoryPaymentStore::new();
        store
            .insert_user(alice(), Some("0x00000000000000000000000000000000000000aa".into()))
            .await;

        store.add_credits("alice", Decimal::from(20)).await.unwrap();
        let balance = store.add_credits("alice", Decimal::new(55, 1)).await.unwrap();
        assert_eq!(balance, Decimal::new(255, 1));

        assert!(matches!(
            store.add_credits("mallory", Decimal::ONE).await,
            Err(StoreError::UnknownUser(_))
        ));
        assert!(store
            .find_eth_address_by_user_name("alice")
            .await
            .unwrap()
            .is_some());
    }
}
