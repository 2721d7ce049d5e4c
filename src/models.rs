use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Block object as delivered by `eth_getBlockByNumber(.., true)` or a Streams payload.
///
/// Every quantity stays hex-encoded; decoding happens in the extractor so that a
/// malformed field degrades to zero instead of rejecting the whole block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBlock {
    #[serde(default, deserialize_with = "lenient_hex")]
    pub number: Option<String>,
    #[serde(default, deserialize_with = "lenient_hex")]
    pub hash: Option<String>,
    #[serde(default, deserialize_with = "lenient_hex")]
    pub timestamp: Option<String>,
    #[serde(default, deserialize_with = "lenient_hex")]
    pub base_fee_per_gas: Option<String>,
    #[serde(default, deserialize_with = "lenient_hex")]
    pub gas_limit: Option<String>,
    #[serde(default, deserialize_with = "lenient_hex")]
    pub gas_used: Option<String>,
    #[serde(default, deserialize_with = "lenient_hex")]
    pub blob_gas_used: Option<String>,
    #[serde(default, deserialize_with = "lenient_transactions")]
    pub transactions: Vec<RawTransaction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    #[serde(default, deserialize_with = "lenient_hex")]
    pub hash: Option<String>,
    #[serde(default, deserialize_with = "lenient_hex")]
    pub from: Option<String>,
    #[serde(default, deserialize_with = "lenient_hex")]
    pub to: Option<String>,
    #[serde(default, deserialize_with = "lenient_hex")]
    pub gas_price: Option<String>,
    #[serde(default, deserialize_with = "lenient_hex")]
    pub max_fee_per_gas: Option<String>,
    #[serde(default, deserialize_with = "lenient_hex")]
    pub max_priority_fee_per_gas: Option<String>,
    #[serde(default, rename = "type", deserialize_with = "lenient_hex")]
    pub tx_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_hex")]
    pub value: Option<String>,
    #[serde(default, deserialize_with = "lenient_hex")]
    pub gas: Option<String>,
}

// Strings pass through untouched, plain JSON integers are re-encoded as hex and
// anything else (null, bool, objects) reads as absent.
fn lenient_hex<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => Some(s),
        Value::Number(n) => n.as_u64().map(|v| format!("{:#x}", v)),
        _ => None,
    })
}

// Hash-only bodies (`eth_getBlockByNumber(.., false)`) carry strings instead of objects.
fn lenient_transactions<'de, D>(deserializer: D) -> Result<Vec<RawTransaction>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let Value::Array(items) = value else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter(Value::is_object)
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxKind {
    Legacy,
    Eip1559,
    Eip4844,
    Other,
}

impl TxKind {
    pub fn from_type(tx_type: u64) -> Self {
        match tx_type {
            0 => TxKind::Legacy,
            2 => TxKind::Eip1559,
            3 => TxKind::Eip4844,
            _ => TxKind::Other,
        }
    }
}

/// Per-type transaction counts. Only the three named buckets are published;
/// `other` (access-list, set-code, unknown) is kept for callers that want it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxTypeCounts {
    pub legacy: u64,
    pub eip1559: u64,
    pub eip4844: u64,
    #[serde(skip)]
    pub other: u64,
}

impl TxTypeCounts {
    pub fn record(&mut self, kind: TxKind) {
        match kind {
            TxKind::Legacy => self.legacy += 1,
            TxKind::Eip1559 => self.eip1559 += 1,
            TxKind::Eip4844 => self.eip4844 += 1,
            TxKind::Other => self.other += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityFeeStats {
    pub avg_priority_fee: f64,
    pub median_priority_fee: f64,
    pub std_dev_priority_fee: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatistics {
    pub count: u64,
    pub total_value_transferred: f64,
    pub avg_gas_price: f64,
    pub median_gas_price: f64,
    pub std_dev_gas_price: f64,
    pub avg_gas_used_per_tx: f64,
    pub types: TxTypeCounts,
    pub priority_fees_stats: Option<PriorityFeeStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Congestion {
    Low,
    Medium,
    High,
}

impl Congestion {
    pub fn from_utilization(utilization_percent: f64) -> Self {
        if utilization_percent > 80.0 {
            Congestion::High
        } else if utilization_percent > 50.0 {
            Congestion::Medium
        } else {
            Congestion::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Congestion::Low => "low",
            Congestion::Medium => "medium",
            Congestion::High => "high",
        }
    }
}

impl fmt::Display for Congestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Stable,
    Moderate,
    Rising,
    Critical,
}

impl Trend {
    pub fn from_base_fee(base_fee_gwei: f64) -> Self {
        if base_fee_gwei > 200.0 {
            Trend::Critical
        } else if base_fee_gwei > 100.0 {
            Trend::Rising
        } else if base_fee_gwei > 50.0 {
            Trend::Moderate
        } else {
            Trend::Stable
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Stable => "stable",
            Trend::Moderate => "moderate",
            Trend::Rising => "rising",
            Trend::Critical => "critical",
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown variant `{0}`")]
pub struct UnknownVariant(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub congestion: Congestion,
    pub trend: Trend,
    pub blobs_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobStatus {
    pub active: bool,
    pub utilization_percent: f64,
}

/// Normalized metrics for one block. Gwei and percent fields carry two decimals,
/// `transaction_stats.total_value_transferred` four.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMetrics {
    pub number: u64,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub base_fee_gwei: f64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub blob_gas_used: u64,
    pub utilization_percent: f64,
    pub transaction_stats: TransactionStatistics,
    pub network_status: NetworkStatus,
    pub blobs_status: BlobStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartPoint {
    pub time: DateTime<Utc>,
    pub price: f64,
    pub network_load: f64,
    pub transactions: u64,
    pub value_transferred: f64,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSeries {
    pub range: TimeRange,
    pub points: Vec<ChartPoint>,
    pub percent_change: f64,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum TimeRange {
    #[serde(rename = "2h")]
    #[value(name = "2h")]
    TwoHours,
    #[serde(rename = "4h")]
    #[value(name = "4h")]
    FourHours,
    #[serde(rename = "8h")]
    #[value(name = "8h")]
    EightHours,
    #[default]
    #[serde(rename = "24h")]
    #[value(name = "24h")]
    Day,
    #[serde(rename = "1w")]
    #[value(name = "1w")]
    Week,
}

impl TimeRange {
    pub fn window(&self) -> Duration {
        match self {
            TimeRange::TwoHours => Duration::hours(2),
            TimeRange::FourHours => Duration::hours(4),
            TimeRange::EightHours => Duration::hours(8),
            TimeRange::Day => Duration::hours(24),
            TimeRange::Week => Duration::days(7),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeRange::TwoHours => "2h",
            TimeRange::FourHours => "4h",
            TimeRange::EightHours => "8h",
            TimeRange::Day => "24h",
            TimeRange::Week => "1w",
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AlertDirection {
    Below,
    Above,
}

impl AlertDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertDirection::Below => "below",
            AlertDirection::Above => "above",
        }
    }
}

impl FromStr for AlertDirection {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "below" => Ok(AlertDirection::Below),
            "above" => Ok(AlertDirection::Above),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub threshold: f64,
    #[serde(rename = "type")]
    pub direction: AlertDirection,
    pub created_at: Option<DateTime<Utc>>,
    pub last_triggered: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Entered,
    Cleared,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertTransition {
    pub alert_id: String,
    pub kind: TransitionKind,
    pub observed_price: f64,
    pub timestamp: DateTime<Utc>,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertNotification {
    pub id: String,
    pub alert_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LargeTransfer {
    pub tx_hash: String,
    pub block_number: u64,
    pub from: String,
    pub to: Option<String>,
    pub value_eth: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WhaleSummary {
    pub address: String,
    pub total_blocks: i64,
    pub total_transactions: i64,
    pub total_value_eth: f64,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GasStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub blocks: i64,
}
