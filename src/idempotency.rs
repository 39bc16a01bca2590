use crate::models::SubmissionReceipt;
use redis::AsyncCommands;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Receipts of successful submissions keyed by `Idempotency-Key`. Redis when
/// configured, otherwise process memory.
#[derive(Clone)]
pub struct ReceiptCache {
    redis: Option<redis::Client>,
    memory: Arc<Mutex<HashMap<String, SubmissionReceipt>>>,
    ttl_secs: u64,
}

impl ReceiptCache {
    pub fn new(redis: Option<redis::Client>, ttl_secs: u64) -> Self {
        Self {
            redis,
            memory: Arc::new(Mutex::new(HashMap::new())),
            ttl_secs,
        }
    }

    pub fn from_env() -> Self {
        let redis = std::env::var("REDIS_URL")
            .ok()
            .and_then(|url| match redis::Client::open(url) {
                Ok(client) => Some(client),
                Err(err) => {
                    warn!(target = "wizard.idempotency", error = %err, "invalid REDIS_URL; using memory");
                    None
                }
            });
        Self::new(redis, crate::config::idempotency_ttl_secs())
    }

    pub async fn get(&self, session: Uuid, key: &str) -> Option<SubmissionReceipt> {
        let key = cache_key(session, key);
        match &self.redis {
            Some(client) => redis_get(client, &key).await,
            None => self.memory.lock().await.get(&key).cloned(),
        }
    }

    pub async fn put(&self, session: Uuid, key: &str, receipt: &SubmissionReceipt) {
        let key = cache_key(session, key);
        match &self.redis {
            Some(client) => redis_set(client, &key, receipt, self.ttl_secs).await,
            None => {
                self.memory.lock().await.insert(key, receipt.clone());
            }
        }
    }
}

fn cache_key(session: Uuid, key: &str) -> String {
    format!("listing-wizard:submit:{session}:{key}")
}

pub async fn redis_get(client: &redis::Client, key: &str) -> Option<SubmissionReceipt> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(_) => return None,
    };
    let s: Option<String> = conn.get(key).await.ok();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

pub async fn redis_set(
    client: &redis::Client,
    key: &str,
    value: &SubmissionReceipt,
    ttl_secs: u64,
) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
    }
}
