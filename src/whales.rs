use crate::extract::{hex_u128, round_to, wei_to_eth, WEI_PER_ETH};
use crate::models::{BlockMetrics, LargeTransfer, RawBlock};

pub const DEFAULT_WHALE_MIN_ETH: f64 = 0.5;

pub fn eth_to_wei(eth: f64) -> u128 {
    if !eth.is_finite() || eth <= 0.0 {
        return 0;
    }
    (eth * WEI_PER_ETH as f64) as u128
}

/// Transactions in `block` moving at least `min_wei`. Entries without a hash or
/// sender are skipped since they cannot be keyed.
pub fn large_transfers(block: &RawBlock, metrics: &BlockMetrics, min_wei: u128) -> Vec<LargeTransfer> {
    block
        .transactions
        .iter()
        .filter_map(|tx| {
            let value = hex_u128(tx.value.as_deref());
            if value < min_wei || value == 0 {
                return None;
            }
            Some(LargeTransfer {
                tx_hash: tx.hash.clone()?,
                block_number: metrics.number,
                from: tx.from.as_ref()?.to_lowercase(),
                to: tx.to.as_ref().map(|to| to.to_lowercase()),
                value_eth: round_to(wei_to_eth(value), 6),
                timestamp: metrics.timestamp,
            })
        })
        .collect()
}
