//! Raw payload → stored metrics → alert transitions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ethers_providers::{Middleware, Provider, Ws};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::alerts::{self, transition_message};
use crate::envelope::RawBlockEnvelope;
use crate::eth::{catch_up_range, EthClient};
use crate::extract::{block_metrics, ExtractionError};
use crate::ingest_stats::INGEST_STATS;
use crate::models::{AlertTransition, BlockMetrics, TransitionKind};
use crate::storage::{self, DbPool};
use crate::whales;

/// Blocks fetched per catch-up pass when following the head.
const MAX_CATCH_UP_BLOCKS: u64 = 64;

#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("failed to store block {block_number}")]
    Store {
        block_number: u64,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Stored {
        metrics: BlockMetrics,
        transitions: Vec<AlertTransition>,
        large_transfers: usize,
    },
    Duplicate {
        block_number: u64,
    },
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestSummary {
    pub stored: usize,
    pub duplicates: usize,
    pub failed: usize,
}

impl IngestSummary {
    fn record(&mut self, result: &Result<IngestOutcome, IngestError>) {
        match result {
            Ok(IngestOutcome::Stored { .. }) => self.stored += 1,
            Ok(IngestOutcome::Duplicate { .. }) => self.duplicates += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Clones share one lock, so blocks are applied one at a time and alert
/// transitions are evaluated in arrival order.
#[derive(Clone)]
pub struct Ingestor {
    pool: DbPool,
    whale_min_wei: u128,
    serial: Arc<Mutex<()>>,
}

impl Ingestor {
    pub fn new(pool: DbPool, whale_min_wei: u128) -> Self {
        Self {
            pool,
            whale_min_wei,
            serial: Arc::new(Mutex::new(())),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn ingest_payload(&self, payload: Value) -> Result<IngestOutcome, IngestError> {
        self.ingest_envelope(RawBlockEnvelope::from_value(payload))
            .await
    }

    pub async fn ingest_envelope(
        &self,
        envelope: RawBlockEnvelope,
    ) -> Result<IngestOutcome, IngestError> {
        let block = envelope.into_block().inspect_err(|_| {
            INGEST_STATS.inc_skipped_payloads(1);
        })?;
        let metrics = block_metrics(&block);
        let block_number = metrics.number;
        let _guard = self.serial.lock().await;

        let prior_head = storage::max_block_number(&self.pool)
            .await
            .map_err(|source| IngestError::Store {
                block_number,
                source,
            })?;
        let inserted = storage::insert_block_data(&self.pool, &metrics)
            .await
            .map_err(|source| IngestError::Store {
                block_number,
                source,
            })?;
        if !inserted {
            INGEST_STATS.inc_duplicate_blocks(1);
            debug!("block {} already stored", block_number);
            return Ok(IngestOutcome::Duplicate { block_number });
        }
        INGEST_STATS.inc_blocks(1);
        INGEST_STATS.inc_transactions(metrics.transaction_stats.count);

        let transfers = whales::large_transfers(&block, &metrics, self.whale_min_wei);
        if let Err(err) = storage::insert_large_transfers(&self.pool, &transfers).await {
            warn!("block {}: failed storing large transfers: {:#}", block_number, err);
        }

        // Alerts follow the chain head; a late older block is stored but not evaluated.
        let transitions = if prior_head.is_some_and(|head| block_number < head) {
            debug!(
                "block {} is behind head {:?}, skipping alert evaluation",
                block_number, prior_head
            );
            Vec::new()
        } else {
            // The row is committed at this point; an alert failure must not undo it.
            match self.apply_alerts(&metrics).await {
                Ok(transitions) => transitions,
                Err(err) => {
                    warn!("block {}: alert evaluation failed: {:#}", block_number, err);
                    Vec::new()
                }
            }
        };

        info!(
            "block {} stored: base fee {:.2} Gwei, {:.2}% full, {} txs, {} congestion",
            block_number,
            metrics.base_fee_gwei,
            metrics.utilization_percent,
            metrics.transaction_stats.count,
            metrics.network_status.congestion
        );

        Ok(IngestOutcome::Stored {
            metrics,
            transitions,
            large_transfers: transfers.len(),
        })
    }

    // Returns the transitions that were actually recorded. A failed write stops the
    // pass; the ones already committed are still reported.
    async fn apply_alerts(&self, metrics: &BlockMetrics) -> Result<Vec<AlertTransition>> {
        let alerts = storage::list_alerts(&self.pool).await?;
        if alerts.is_empty() {
            return Ok(Vec::new());
        }
        let prior = storage::load_alert_states(&self.pool).await?;
        let transitions = alerts::evaluate(&alerts, metrics, &prior);

        let mut recorded = Vec::with_capacity(transitions.len());
        for transition in transitions {
            let Some(alert) = alerts.iter().find(|a| a.id == transition.alert_id) else {
                continue;
            };
            let message = transition_message(alert, &transition);
            if let Err(err) =
                storage::record_alert_transition(&self.pool, &transition, &message).await
            {
                warn!(
                    "block {}: failed to record transition for alert {}: {:#}",
                    metrics.number, alert.id, err
                );
                break;
            }
            match transition.kind {
                TransitionKind::Entered => warn!("{}", message),
                TransitionKind::Cleared => info!("{}", message),
            }
            recorded.push(transition);
        }
        INGEST_STATS.inc_alert_transitions(recorded.len() as u64);
        Ok(recorded)
    }
}

/// Fetches and ingests the newest `count` blocks. A block that fails is logged and
/// counted; the rest still go through.
pub async fn ingest_recent(
    ingestor: &Ingestor,
    client: &EthClient,
    count: u64,
) -> Result<IngestSummary> {
    let mut summary = IngestSummary::default();
    if count == 0 {
        return Ok(summary);
    }

    let latest = client.latest_block_number().await?;
    let start = latest.saturating_sub(count - 1);

    for number in start..=latest {
        let payload = match client.fetch_block(number).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                warn!("block {} not available from node", number);
                summary.failed += 1;
                continue;
            }
            Err(err) => {
                warn!("{:#}", err);
                summary.failed += 1;
                continue;
            }
        };
        let result = ingestor.ingest_payload(payload).await;
        if let Err(err) = &result {
            warn!("skipping block {}: {}", number, err);
        }
        summary.record(&result);
    }

    Ok(summary)
}

/// Follows the chain head by polling `eth_blockNumber`. Runs until the task is dropped.
pub async fn watch_poll(ingestor: &Ingestor, client: &EthClient, poll: Duration) -> Result<()> {
    let mut next = storage::max_block_number(ingestor.pool())
        .await?
        .map(|n| n + 1);
    let mut ticker = tokio::time::interval(poll);
    info!("polling for new blocks every {:?}", poll);

    loop {
        ticker.tick().await;
        let head = match client.latest_block_number().await {
            Ok(head) => head,
            Err(err) => {
                warn!("{:#}", err);
                continue;
            }
        };
        next = catch_up(ingestor, client, next, head).await;
    }
}

/// Follows the chain head via a `newHeads` subscription; block bodies still come
/// over HTTP. Returns an error when the subscription ends.
pub async fn watch_ws(ingestor: &Ingestor, client: &EthClient, ws_url: &str) -> Result<()> {
    let ws_provider = Provider::<Ws>::connect(ws_url)
        .await
        .context("failed to connect to ETH_WS_URL")?;
    let mut heads = ws_provider
        .subscribe_blocks()
        .await
        .context("failed to subscribe to new heads")?;
    info!("subscribed to new heads");

    let mut next = storage::max_block_number(ingestor.pool())
        .await?
        .map(|n| n + 1);

    while let Some(head) = heads.next().await {
        let Some(number) = head.number else {
            continue;
        };
        next = catch_up(ingestor, client, next, number.as_u64()).await;
    }

    bail!("new heads subscription closed")
}

// Returns the next block number to look at. A block the node cannot serve yet
// stops the pass so it is retried on the next head.
async fn catch_up(ingestor: &Ingestor, client: &EthClient, next: Option<u64>, head: u64) -> Option<u64> {
    let Some((start, end)) = catch_up_range(next, head, MAX_CATCH_UP_BLOCKS) else {
        return next;
    };
    for number in start..=end {
        match client.fetch_block(number).await {
            Ok(Some(payload)) => {
                if let Err(err) = ingestor.ingest_payload(payload).await {
                    warn!("skipping block {}: {:#}", number, anyhow::Error::from(err));
                }
            }
            Ok(None) => {
                debug!("block {} not served yet", number);
                return Some(number);
            }
            Err(err) => {
                warn!("{:#}", err);
                return Some(number);
            }
        }
    }
    Some(end + 1)
}
