use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::database::BindingsDatabase;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a first-login funding check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FundingOutcome {
    /// A transfer was sent and the marker recorded.
    Granted { tx_digest: String },
    /// A marker already exists for this address; nothing was sent.
    AlreadyFunded,
    /// The wallet holds a balance; no transfer is needed.
    NotNeeded,
}

/// What to do for an observed (marker, balance) pair. Kept separate from the
/// network calls so the ordering is a tested branch: the persisted marker is
/// consulted before the balance, and a zero balance seen twice never produces
/// a second transfer.
fn decide(marker_exists: bool, balance: u128) -> FundingDecision {
    if marker_exists {
        FundingDecision::Skip(FundingOutcome::AlreadyFunded)
    } else if balance > 0 {
        FundingDecision::Skip(FundingOutcome::NotNeeded)
    } else {
        FundingDecision::Transfer
    }
}

#[derive(Debug, PartialEq, Eq)]
enum FundingDecision {
    Skip(FundingOutcome),
    Transfer,
}

/// One-time funding of freshly connected wallets. Balance reads go to the
/// chain RPC; transfers go to a hosted transfer endpoint authenticated with
/// the funding wallet key. The grant marker in the database makes the whole
/// operation idempotent per address.
#[derive(Clone)]
pub struct FundingService {
    client: reqwest::Client,
    rpc_url: String,
    funding_api_url: String,
    wallet_key: String,
    amount: u64,
    db: Arc<BindingsDatabase>,
}

#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    recipient: &'a str,
    amount: u64,
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    digest: String,
}

impl FundingService {
    pub fn new(
        rpc_url: String,
        funding_api_url: String,
        wallet_key: String,
        amount: u64,
        db: Arc<BindingsDatabase>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            rpc_url,
            funding_api_url: funding_api_url.trim_end_matches('/').to_string(),
            wallet_key,
            amount,
            db,
        }
    }

    /// Fund the address once, ever. Marker first, then balance, then the
    /// transfer; the marker is written before the outcome is returned.
    pub async fn fund_if_unfunded(&self, address: &str) -> Result<FundingOutcome> {
        let marker_exists = self.db.funding_grant(address)?.is_some();
        let balance = if marker_exists {
            0
        } else {
            self.balance(address).await?
        };

        match decide(marker_exists, balance) {
            FundingDecision::Skip(outcome) => Ok(outcome),
            FundingDecision::Transfer => {
                let tx_digest = self.transfer(address).await?;
                self.db.record_funding(address, &tx_digest)?;
                tracing::info!("Funded wallet {} (tx {})", address, tx_digest);
                Ok(FundingOutcome::Granted { tx_digest })
            }
        }
    }

    async fn balance(&self, address: &str) -> Result<u128> {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "suix_getBalance",
            "params": [address],
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .context("Failed to reach chain RPC")?;

        if !response.status().is_success() {
            anyhow::bail!("Chain RPC returned error {}", response.status());
        }

        let body: Value = response
            .json()
            .await
            .context("Failed to parse chain RPC response")?;
        parse_total_balance(&body)
    }

    async fn transfer(&self, recipient: &str) -> Result<String> {
        let url = format!("{}/v1/transfers", self.funding_api_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.wallet_key))
            .json(&TransferRequest {
                recipient,
                amount: self.amount,
            })
            .send()
            .await
            .context("Failed to reach transfer endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Transfer endpoint returned error {}: {}", status, body);
        }

        let transfer: TransferResponse = response
            .json()
            .await
            .context("Failed to parse transfer response")?;
        Ok(transfer.digest)
    }
}

fn parse_total_balance(body: &Value) -> Result<u128> {
    if let Some(error) = body.get("error") {
        anyhow::bail!("Chain RPC error: {}", error);
    }
    let raw = body
        .get("result")
        .and_then(|result| result.get("totalBalance"))
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("Chain RPC response carried no totalBalance"))?;
    raw.parse::<u128>()
        .with_context(|| format!("Invalid totalBalance: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_wins_over_balance() {
        assert_eq!(
            decide(true, 0),
            FundingDecision::Skip(FundingOutcome::AlreadyFunded)
        );
        assert_eq!(
            decide(true, 500),
            FundingDecision::Skip(FundingOutcome::AlreadyFunded)
        );
    }

    #[test]
    fn nonzero_balance_skips_the_transfer() {
        assert_eq!(
            decide(false, 1),
            FundingDecision::Skip(FundingOutcome::NotNeeded)
        );
    }

    #[test]
    fn fresh_empty_wallet_gets_a_transfer() {
        assert_eq!(decide(false, 0), FundingDecision::Transfer);
    }

    #[test]
    fn parses_total_balance_from_rpc_result() {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": { "coinType": "0x2::sui::SUI", "totalBalance": "123456789" }
        });
        assert_eq!(parse_total_balance(&body).unwrap(), 123_456_789);
    }

    #[test]
    fn surfaces_rpc_errors_and_malformed_results() {
        let error_body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32602, "message": "Invalid address" }
        });
        assert!(parse_total_balance(&error_body).is_err());

        let missing = serde_json::json!({ "jsonrpc": "2.0", "id": 1, "result": {} });
        assert!(parse_total_balance(&missing).is_err());

        let garbage = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": { "totalBalance": "not-a-number" }
        });
        assert!(parse_total_balance(&garbage).is_err());
    }
}
