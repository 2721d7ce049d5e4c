use std::collections::HashMap;

use serde::Serialize;

use crate::models::{Alert, AlertDirection, AlertTransition, BlockMetrics, TransitionKind};

/// Last known triggered flag per alert id. Alerts never seen count as not triggered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlertStates(HashMap<String, bool>);

impl AlertStates {
    pub fn is_triggered(&self, alert_id: &str) -> bool {
        self.0.get(alert_id).copied().unwrap_or(false)
    }

    pub fn set(&mut self, alert_id: impl Into<String>, triggered: bool) {
        self.0.insert(alert_id.into(), triggered);
    }

    pub fn apply(&mut self, transitions: &[AlertTransition]) {
        for t in transitions {
            self.set(t.alert_id.clone(), t.kind == TransitionKind::Entered);
        }
    }
}

pub fn is_triggered(alert: &Alert, price_gwei: f64) -> bool {
    match alert.direction {
        AlertDirection::Below => price_gwei <= alert.threshold,
        AlertDirection::Above => price_gwei >= alert.threshold,
    }
}

/// Compares the latest base fee against every enabled alert and returns the alerts
/// whose triggered state differs from `prior`. Disabled alerts produce nothing.
pub fn evaluate(
    alerts: &[Alert],
    latest: &BlockMetrics,
    prior: &AlertStates,
) -> Vec<AlertTransition> {
    let price = latest.base_fee_gwei;
    alerts
        .iter()
        .filter(|alert| alert.enabled)
        .filter_map(|alert| {
            let now = is_triggered(alert, price);
            if now == prior.is_triggered(&alert.id) {
                return None;
            }
            Some(AlertTransition {
                alert_id: alert.id.clone(),
                kind: if now {
                    TransitionKind::Entered
                } else {
                    TransitionKind::Cleared
                },
                observed_price: price,
                timestamp: latest.timestamp,
                block_number: latest.number,
            })
        })
        .collect()
}

pub fn transition_message(alert: &Alert, transition: &AlertTransition) -> String {
    match transition.kind {
        TransitionKind::Entered => format!(
            "Gas alert {}: base fee {:.2} Gwei is {} threshold {} Gwei",
            alert.name,
            transition.observed_price,
            alert.direction.as_str(),
            alert.threshold
        ),
        TransitionKind::Cleared => format!(
            "Gas normal {}: base fee {:.2} Gwei is back past threshold {} Gwei",
            alert.name, transition.observed_price, alert.threshold
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::block_metrics;
    use crate::models::RawBlock;

    fn alert(id: &str, threshold: f64, direction: AlertDirection) -> Alert {
        Alert {
            id: id.to_string(),
            name: format!("alert {}", id),
            enabled: true,
            threshold,
            direction,
            created_at: None,
            last_triggered: None,
        }
    }

    fn block_at_price(number: u64, gwei: u64) -> BlockMetrics {
        block_metrics(&RawBlock {
            number: Some(format!("{:#x}", number)),
            base_fee_per_gas: Some(format!("{:#x}", gwei as u128 * 1_000_000_000)),
            ..Default::default()
        })
    }

    #[test]
    fn below_alert_enters_once_and_clears_once() {
        let alerts = vec![alert("a", 30.0, AlertDirection::Below)];
        let mut states = AlertStates::default();
        let mut emitted = Vec::new();

        for (i, price) in [35, 28, 28, 31].into_iter().enumerate() {
            let transitions = evaluate(&alerts, &block_at_price(i as u64, price), &states);
            states.apply(&transitions);
            emitted.extend(transitions);
        }

        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].kind, TransitionKind::Entered);
        assert_eq!(emitted[0].observed_price, 28.0);
        assert_eq!(emitted[0].block_number, 1);
        assert_eq!(emitted[1].kind, TransitionKind::Cleared);
        assert_eq!(emitted[1].observed_price, 31.0);
    }

    #[test]
    fn above_alert_includes_threshold() {
        let alerts = vec![alert("hi", 100.0, AlertDirection::Above)];
        let transitions = evaluate(&alerts, &block_at_price(1, 100), &AlertStates::default());
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].kind, TransitionKind::Entered);
    }

    #[test]
    fn evaluation_is_idempotent_for_same_inputs() {
        let alerts = vec![alert("a", 30.0, AlertDirection::Below)];
        let latest = block_at_price(1, 20);
        let prior = AlertStates::default();

        let first = evaluate(&alerts, &latest, &prior);
        let second = evaluate(&alerts, &latest, &prior);
        assert_eq!(first, second);

        let mut after = prior.clone();
        after.apply(&first);
        assert!(evaluate(&alerts, &latest, &after).is_empty());
    }

    #[test]
    fn disabled_alerts_are_skipped() {
        let mut disabled = alert("off", 30.0, AlertDirection::Below);
        disabled.enabled = false;
        let mut prior = AlertStates::default();
        prior.set("off", true);

        assert!(evaluate(&[disabled], &block_at_price(1, 50), &prior).is_empty());
    }

    #[test]
    fn untriggered_alert_without_history_stays_quiet() {
        let alerts = vec![alert("a", 30.0, AlertDirection::Below)];
        assert!(evaluate(&alerts, &block_at_price(1, 40), &AlertStates::default()).is_empty());
    }

    #[test]
    fn messages_mention_price_and_threshold() {
        let a = alert("a", 30.0, AlertDirection::Below);
        let t = evaluate(&[a.clone()], &block_at_price(1, 28), &AlertStates::default()).remove(0);
        let msg = transition_message(&a, &t);
        assert!(msg.contains("28.00 Gwei"));
        assert!(msg.contains("below threshold 30 Gwei"));
    }
}
