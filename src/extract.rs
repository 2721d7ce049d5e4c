//! Block metrics extraction.
//!
//! Turns one canonical [`RawBlock`] into a [`BlockMetrics`] record. Everything here is
//! pure: decoding never fails on bad numbers (they read as zero), and the only error
//! is a payload with no block object at all.

use chrono::{DateTime, Utc};

use crate::envelope::RawBlockEnvelope;
use crate::models::{
    BlobStatus, BlockMetrics, Congestion, NetworkStatus, PriorityFeeStats, RawBlock,
    RawTransaction, TransactionStatistics, Trend, TxKind, TxTypeCounts,
};

pub const WEI_PER_GWEI: u128 = 1_000_000_000;
pub const WEI_PER_ETH: u128 = 1_000_000_000_000_000_000;
/// EIP-4844 per-block blob gas cap.
pub const MAX_BLOB_GAS_PER_BLOCK: u64 = 524_288;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("payload does not contain a block object")]
    MissingBlock,
}

pub fn extract(envelope: RawBlockEnvelope) -> Result<BlockMetrics, ExtractionError> {
    let block = envelope.into_block()?;
    Ok(block_metrics(&block))
}

pub fn block_metrics(block: &RawBlock) -> BlockMetrics {
    let number = hex_u64(block.number.as_deref());
    let timestamp = block_time(hex_u64(block.timestamp.as_deref()));
    let base_fee_gwei = wei_to_gwei(hex_u128(block.base_fee_per_gas.as_deref()));
    let gas_limit = hex_u64(block.gas_limit.as_deref());
    let gas_used = hex_u64(block.gas_used.as_deref());
    let blob_gas_used = hex_u64(block.blob_gas_used.as_deref());

    let utilization = if gas_limit > 0 {
        gas_used as f64 / gas_limit as f64 * 100.0
    } else {
        0.0
    };

    let transaction_stats = block
        .transactions
        .iter()
        .fold(TxStatsBuilder::default(), |mut builder, tx| {
            builder.push(tx);
            builder
        })
        .finish();

    let blobs_active = blob_gas_used > 0;
    let blob_utilization = if blobs_active {
        blob_gas_used as f64 / MAX_BLOB_GAS_PER_BLOCK as f64 * 100.0
    } else {
        0.0
    };

    BlockMetrics {
        number,
        hash: block.hash.clone().unwrap_or_default(),
        timestamp,
        base_fee_gwei: round_to(base_fee_gwei, 2),
        gas_limit,
        gas_used,
        blob_gas_used,
        utilization_percent: round_to(utilization, 2),
        transaction_stats,
        // Classification uses the unrounded values.
        network_status: NetworkStatus {
            congestion: Congestion::from_utilization(utilization),
            trend: Trend::from_base_fee(base_fee_gwei),
            blobs_active,
        },
        blobs_status: BlobStatus {
            active: blobs_active,
            utilization_percent: round_to(blob_utilization, 2),
        },
    }
}

/// Single-pass accumulator over a block's transaction list.
#[derive(Debug, Default)]
struct TxStatsBuilder {
    gas_prices_gwei: Vec<f64>,
    priority_fees_gwei: Vec<f64>,
    saw_priority_fee: bool,
    total_value_wei: u128,
    total_gas: u128,
    types: TxTypeCounts,
}

impl TxStatsBuilder {
    fn push(&mut self, tx: &RawTransaction) {
        let gas_price = tx
            .gas_price
            .as_deref()
            .or(tx.max_fee_per_gas.as_deref())
            .map(|hex| hex_u128(Some(hex)))
            .unwrap_or(0);
        self.gas_prices_gwei.push(wei_to_gwei(gas_price));

        // A zero tip still counts; only the presence of the field matters for emission.
        if tx.max_priority_fee_per_gas.is_some() {
            self.saw_priority_fee = true;
        }
        let priority_fee = hex_u128(tx.max_priority_fee_per_gas.as_deref());
        self.priority_fees_gwei.push(wei_to_gwei(priority_fee));

        self.total_value_wei = self
            .total_value_wei
            .saturating_add(hex_u128(tx.value.as_deref()));
        self.total_gas = self.total_gas.saturating_add(hex_u128(tx.gas.as_deref()));
        self.types
            .record(TxKind::from_type(hex_u64(tx.tx_type.as_deref())));
    }

    fn finish(self) -> TransactionStatistics {
        let count = self.gas_prices_gwei.len() as u64;
        let avg_gas_price = mean(&self.gas_prices_gwei);
        let avg_gas_used_per_tx = if count > 0 {
            self.total_gas as f64 / count as f64
        } else {
            0.0
        };

        let priority_fees_stats = self.saw_priority_fee.then(|| {
            let avg = mean(&self.priority_fees_gwei);
            PriorityFeeStats {
                avg_priority_fee: round_to(avg, 2),
                median_priority_fee: round_to(median(&self.priority_fees_gwei), 2),
                std_dev_priority_fee: round_to(std_dev(&self.priority_fees_gwei, avg), 2),
            }
        });

        TransactionStatistics {
            count,
            total_value_transferred: round_to(wei_to_eth(self.total_value_wei), 4),
            avg_gas_price: round_to(avg_gas_price, 2),
            median_gas_price: round_to(median(&self.gas_prices_gwei), 2),
            std_dev_gas_price: round_to(std_dev(&self.gas_prices_gwei, avg_gas_price), 2),
            avg_gas_used_per_tx: round_to(avg_gas_used_per_tx, 2),
            types: self.types,
            priority_fees_stats,
        }
    }
}

/// Decodes an Ethereum quantity. Absent, empty or malformed input reads as zero,
/// as does anything wider than 128 bits.
pub fn hex_u128(raw: Option<&str>) -> u128 {
    let Some(raw) = raw else {
        return 0;
    };
    let raw = raw.trim();
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    if digits.is_empty() {
        return 0;
    }
    u128::from_str_radix(digits, 16).unwrap_or(0)
}

pub fn hex_u64(raw: Option<&str>) -> u64 {
    u64::try_from(hex_u128(raw)).unwrap_or(0)
}

pub fn wei_to_gwei(wei: u128) -> f64 {
    wei as f64 / WEI_PER_GWEI as f64
}

/// Splits whole and fractional ether before going to floating point so large
/// totals keep their sub-ether digits.
pub fn wei_to_eth(wei: u128) -> f64 {
    let whole = wei / WEI_PER_ETH;
    let frac = wei % WEI_PER_ETH;
    whole as f64 + frac as f64 / WEI_PER_ETH as f64
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

/// Population standard deviation around a precomputed mean.
pub fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn block_time(unix_secs: u64) -> DateTime<Utc> {
    i64::try_from(unix_secs)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawTransaction;

    fn gwei_hex(gwei: u64) -> Option<String> {
        Some(format!("{:#x}", gwei as u128 * WEI_PER_GWEI))
    }

    fn block_with(txs: Vec<RawTransaction>) -> RawBlock {
        RawBlock {
            number: Some("0x1312d00".into()),
            hash: Some("0xabc".into()),
            timestamp: Some("0x65b13a40".into()),
            base_fee_per_gas: gwei_hex(25),
            gas_limit: Some("0x1c9c380".into()),
            gas_used: Some("0xe4e1c0".into()),
            blob_gas_used: None,
            transactions: txs,
        }
    }

    #[test]
    fn decodes_header_fields() {
        let metrics = block_metrics(&block_with(Vec::new()));
        assert_eq!(metrics.number, 20_000_000);
        assert_eq!(metrics.hash, "0xabc");
        assert_eq!(metrics.timestamp.timestamp(), 0x65b1_3a40);
        assert_eq!(metrics.base_fee_gwei, 25.0);
        assert_eq!(metrics.gas_limit, 30_000_000);
        assert_eq!(metrics.gas_used, 15_000_000);
        assert_eq!(metrics.utilization_percent, 50.0);
        assert_eq!(metrics.network_status.congestion, Congestion::Low);
        assert_eq!(metrics.network_status.trend, Trend::Stable);
    }

    #[test]
    fn zero_gas_limit_has_zero_utilization() {
        let mut block = block_with(Vec::new());
        block.gas_limit = Some("0x0".into());
        let metrics = block_metrics(&block);
        assert_eq!(metrics.utilization_percent, 0.0);
        assert_eq!(metrics.network_status.congestion, Congestion::Low);
    }

    #[test]
    fn empty_block_has_zeroed_stats_and_no_priority_fees() {
        let stats = block_metrics(&block_with(Vec::new())).transaction_stats;
        assert_eq!(stats.count, 0);
        assert_eq!(stats.avg_gas_price, 0.0);
        assert_eq!(stats.median_gas_price, 0.0);
        assert_eq!(stats.std_dev_gas_price, 0.0);
        assert_eq!(stats.avg_gas_used_per_tx, 0.0);
        assert_eq!(stats.total_value_transferred, 0.0);
        assert!(stats.priority_fees_stats.is_none());
    }

    #[test]
    fn missing_fields_read_as_zero() {
        let metrics = block_metrics(&RawBlock::default());
        assert_eq!(metrics.number, 0);
        assert_eq!(metrics.base_fee_gwei, 0.0);
        assert_eq!(metrics.timestamp.timestamp(), 0);
        assert!(metrics.hash.is_empty());
    }

    #[test]
    fn malformed_hex_reads_as_zero() {
        assert_eq!(hex_u128(Some("0xzz")), 0);
        assert_eq!(hex_u128(Some("")), 0);
        assert_eq!(hex_u128(Some("0x")), 0);
        assert_eq!(hex_u128(None), 0);
        assert_eq!(hex_u128(Some("0X1f")), 31);
        assert_eq!(hex_u64(Some("0x1ffffffffffffffff")), 0);
    }

    #[test]
    fn median_and_std_dev_follow_population_formulas() {
        assert_eq!(median(&[10.0, 20.0]), 15.0);
        assert_eq!(median(&[30.0, 10.0, 20.0]), 20.0);
        assert_eq!(std_dev(&[10.0, 10.0, 10.0], 10.0), 0.0);
        assert_eq!(std_dev(&[0.0, 100.0], 50.0), 50.0);
    }

    #[test]
    fn gas_price_falls_back_to_max_fee() {
        let txs = vec![
            RawTransaction {
                gas_price: gwei_hex(10),
                tx_type: Some("0x0".into()),
                ..Default::default()
            },
            RawTransaction {
                max_fee_per_gas: gwei_hex(20),
                max_priority_fee_per_gas: gwei_hex(2),
                tx_type: Some("0x2".into()),
                ..Default::default()
            },
        ];
        let stats = block_metrics(&block_with(txs)).transaction_stats;
        assert_eq!(stats.count, 2);
        assert_eq!(stats.avg_gas_price, 15.0);
        assert_eq!(stats.median_gas_price, 15.0);
        assert_eq!(stats.std_dev_gas_price, 5.0);
        assert_eq!(stats.types.legacy, 1);
        assert_eq!(stats.types.eip1559, 1);

        // The legacy tx contributes a recorded zero tip.
        let fees = stats.priority_fees_stats.unwrap();
        assert_eq!(fees.avg_priority_fee, 1.0);
        assert_eq!(fees.median_priority_fee, 1.0);
        assert_eq!(fees.std_dev_priority_fee, 1.0);
    }

    #[test]
    fn priority_stats_present_when_field_carried_even_if_zero() {
        let txs = vec![RawTransaction {
            gas_price: gwei_hex(5),
            max_priority_fee_per_gas: Some("0x0".into()),
            ..Default::default()
        }];
        let fees = block_metrics(&block_with(txs))
            .transaction_stats
            .priority_fees_stats
            .unwrap();
        assert_eq!(fees.avg_priority_fee, 0.0);
    }

    #[test]
    fn priority_stats_absent_when_no_tx_carries_field() {
        let txs = vec![RawTransaction {
            gas_price: gwei_hex(5),
            ..Default::default()
        }];
        let stats = block_metrics(&block_with(txs)).transaction_stats;
        assert!(stats.priority_fees_stats.is_none());
    }

    #[test]
    fn value_and_gas_totals() {
        let txs = vec![
            RawTransaction {
                value: Some("0xde0b6b3a7640000".into()), // 1 ETH
                gas: Some("0x5208".into()),
                ..Default::default()
            },
            RawTransaction {
                value: Some("0x6f05b59d3b20000".into()), // 0.5 ETH
                gas: Some("0x7530".into()),
                ..Default::default()
            },
        ];
        let stats = block_metrics(&block_with(txs)).transaction_stats;
        assert_eq!(stats.total_value_transferred, 1.5);
        assert_eq!(stats.avg_gas_used_per_tx, 25_500.0);
    }

    #[test]
    fn untyped_tx_counts_as_legacy_and_unknown_types_are_hidden() {
        let txs = vec![
            RawTransaction::default(),
            RawTransaction {
                tx_type: Some("0x1".into()),
                ..Default::default()
            },
            RawTransaction {
                tx_type: Some("0x3".into()),
                ..Default::default()
            },
        ];
        let stats = block_metrics(&block_with(txs)).transaction_stats;
        assert_eq!(stats.count, 3);
        assert_eq!(stats.types.legacy, 1);
        assert_eq!(stats.types.eip4844, 1);
        assert_eq!(stats.types.other, 1);
    }

    #[test]
    fn blob_utilization() {
        let mut block = block_with(Vec::new());
        block.blob_gas_used = Some(format!("{:#x}", MAX_BLOB_GAS_PER_BLOCK));
        let metrics = block_metrics(&block);
        assert!(metrics.blobs_status.active);
        assert!(metrics.network_status.blobs_active);
        assert_eq!(metrics.blobs_status.utilization_percent, 100.0);

        block.blob_gas_used = Some("0x0".into());
        let metrics = block_metrics(&block);
        assert!(!metrics.blobs_status.active);
        assert_eq!(metrics.blobs_status.utilization_percent, 0.0);
    }

    #[test]
    fn classification_thresholds() {
        let mut block = block_with(Vec::new());
        block.gas_limit = Some("0x2710".into()); // 10_000
        block.gas_used = Some("0x1f40".into()); // 8_000 -> 80.0%
        block.base_fee_per_gas = gwei_hex(50);
        let metrics = block_metrics(&block);
        assert_eq!(metrics.network_status.congestion, Congestion::Medium);
        assert_eq!(metrics.network_status.trend, Trend::Stable);

        block.gas_used = Some("0x1f41".into()); // 80.01%
        block.base_fee_per_gas = Some(format!("{:#x}", 50_010_000_000u128));
        let metrics = block_metrics(&block);
        assert_eq!(metrics.network_status.congestion, Congestion::High);
        assert_eq!(metrics.network_status.trend, Trend::Moderate);
    }

    #[test]
    fn extract_rejects_missing_block() {
        let err = extract(RawBlockEnvelope::Empty).unwrap_err();
        assert_eq!(err, ExtractionError::MissingBlock);
    }

    #[test]
    fn wei_to_eth_keeps_fraction_of_large_totals() {
        let wei = 123_456 * WEI_PER_ETH + 5 * WEI_PER_ETH / 10_000;
        assert_eq!(round_to(wei_to_eth(wei), 4), 123_456.0005);
    }
}
