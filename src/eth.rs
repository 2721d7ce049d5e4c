use anyhow::{Context, Result};
use ethers_core::types::BlockNumber;
use ethers_providers::{Http, Middleware, Provider};
use serde_json::Value;
use url::Url;

/// Thin JSON-RPC client. Blocks come back as untyped JSON so that decoding stays in
/// one place (the envelope + extractor) regardless of where a payload came from.
#[derive(Clone)]
pub struct EthClient {
    provider: Provider<Http>,
}

impl EthClient {
    pub fn new(rpc_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .context("failed to build reqwest client")?;
        let url = Url::parse(rpc_url).context("invalid ETH_RPC_URL")?;
        let transport = Http::new_with_client(url, client);
        let provider = Provider::new(transport);
        Ok(Self { provider })
    }

    pub async fn latest_block_number(&self) -> Result<u64> {
        let latest = self
            .provider
            .get_block_number()
            .await
            .context("failed to fetch latest block number")?;
        Ok(latest.as_u64())
    }

    /// `eth_getBlockByNumber(number, true)`; `None` when the node does not have it yet.
    pub async fn fetch_block(&self, number: u64) -> Result<Option<Value>> {
        let raw: Value = self
            .provider
            .request(
                "eth_getBlockByNumber",
                (BlockNumber::Number(number.into()), true),
            )
            .await
            .with_context(|| format!("failed to fetch block {}", number))?;

        Ok(if raw.is_null() { None } else { Some(raw) })
    }
}

/// Range of block numbers to catch up on, capped to the newest `max_blocks`.
pub fn catch_up_range(next: Option<u64>, head: u64, max_blocks: u64) -> Option<(u64, u64)> {
    if max_blocks == 0 {
        return None;
    }
    let floor = head.saturating_sub(max_blocks - 1);
    let start = next.unwrap_or(head).max(floor);
    (start <= head).then_some((start, head))
}
