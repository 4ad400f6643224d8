use async_trait::async_trait;

use crate::error::{CoreError, CoreResult};

/// On-chain balance oracle, consulted synchronously before locking keys.
/// No retry contract upstream: failures surface to the caller as transient
/// `CoreError::Oracle` values.
#[async_trait]
pub trait BalanceOracle: Send + Sync {
    async fn get_balance(&self, wallet_address: &str, owner_id: &str) -> CoreResult<u64>;
}

/// HTTP oracle against a balance endpoint returning `{"balance": <integer>}`.
pub struct HttpBalanceOracle {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBalanceOracle {
    pub fn new(base_url: &str) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.trim_end_matches('/').to_string() }
    }
}

#[derive(serde::Deserialize)]
struct BalanceResponse {
    balance: u64,
}

#[async_trait]
impl BalanceOracle for HttpBalanceOracle {
    async fn get_balance(&self, wallet_address: &str, owner_id: &str) -> CoreResult<u64> {
        let url = format!("{}/balance/{}", self.base_url, wallet_address);
        let resp = self
            .client
            .get(&url)
            .query(&[("owner", owner_id)])
            .send()
            .await
            .map_err(|e| CoreError::Oracle(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CoreError::Oracle(format!("balance endpoint returned {}", resp.status())));
        }
        let body: BalanceResponse =
            resp.json().await.map_err(|e| CoreError::Oracle(e.to_string()))?;
        Ok(body.balance)
    }
}

/// Fixed-table oracle for tests and offline runs.
pub struct StaticBalanceOracle {
    balances: std::sync::Mutex<std::collections::HashMap<String, u64>>,
}

impl StaticBalanceOracle {
    pub fn new() -> Self {
        Self { balances: std::sync::Mutex::new(std::collections::HashMap::new()) }
    }

    pub fn set(&self, wallet_address: &str, balance: u64) {
        if let Ok(mut map) = self.balances.lock() {
            map.insert(wallet_address.to_string(), balance);
        }
    }
}

impl Default for StaticBalanceOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BalanceOracle for StaticBalanceOracle {
    async fn get_balance(&self, wallet_address: &str, _owner_id: &str) -> CoreResult<u64> {
        let map = self
            .balances
            .lock()
            .map_err(|_| CoreError::Oracle("static oracle poisoned".to_string()))?;
        Ok(map.get(wallet_address).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_oracle_defaults_to_zero() {
        let oracle = StaticBalanceOracle::new();
        oracle.set("0xabc", 42);
        assert_eq!(oracle.get_balance("0xabc", "u-1").await.unwrap(), 42);
        assert_eq!(oracle.get_balance("0xdef", "u-1").await.unwrap(), 0);
    }
}
