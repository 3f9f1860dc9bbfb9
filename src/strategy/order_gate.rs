//! AI order-validation gate
//!
//! Asks the advisory service before a new position is opened. A rejection
//! blocks that exact decision for the cooldown without asking again; an
//! approval or a failed call lets the open go ahead.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::combinator::DecisionKey;
use crate::advisory::{AdvisoryService, OrderValidation, OrderValidationRequest};
use crate::persistence::{OrderValidationRecord, TradeStore};

/// A decision the advisory turned down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub at: DateTime<Utc>,
    pub key: DecisionKey,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    Approved(OrderValidation),
    Rejected(OrderValidation),
    /// Same decision was rejected within the cooldown, not re-submitted
    CoolingDown { until: DateTime<Utc> },
    /// Advisory call failed, open allowed
    FailedOpen(String),
    Disabled,
}

impl GateVerdict {
    pub fn allows_open(&self) -> bool {
        matches!(
            self,
            GateVerdict::Approved(_) | GateVerdict::FailedOpen(_) | GateVerdict::Disabled
        )
    }
}

pub struct OrderGate {
    advisory: Arc<dyn AdvisoryService>,
    store: Arc<dyn TradeStore>,
    enabled: bool,
    cooldown: Duration,
}

impl OrderGate {
    pub fn new(
        advisory: Arc<dyn AdvisoryService>,
        store: Arc<dyn TradeStore>,
        enabled: bool,
        cooldown: Duration,
    ) -> Self {
        Self {
            advisory,
            store,
            enabled,
            cooldown,
        }
    }

    /// Whether a proposed open should reach the gate at all this cycle.
    ///
    /// A repeat of last cycle's decision is only re-submitted once its
    /// rejection has expired.
    pub fn should_consult(
        &self,
        key: &DecisionKey,
        last_decision: Option<&DecisionKey>,
        rejection: Option<&Rejection>,
        now: DateTime<Utc>,
    ) -> bool {
        if last_decision != Some(key) {
            return true;
        }
        rejection.map_or(false, |r| r.key == *key && now - r.at >= self.cooldown)
    }

    /// Validate a proposed open, updating `rejection` with the outcome
    pub async fn check(
        &self,
        request: &OrderValidationRequest,
        key: &DecisionKey,
        decision_record_id: Option<u64>,
        rejection: &mut Option<Rejection>,
        now: DateTime<Utc>,
    ) -> GateVerdict {
        if !self.enabled {
            return GateVerdict::Disabled;
        }

        if let Some(previous) = rejection.as_ref() {
            if previous.key == *key && now - previous.at < self.cooldown {
                let until = previous.at + self.cooldown;
                info!(symbol = %request.symbol, %until, "⏳ Decision rejected recently, not re-submitting");
                return GateVerdict::CoolingDown { until };
            }
        }

        let request_data = serde_json::to_string(request).unwrap_or_default();
        let result = self.advisory.validate_order(request).await;

        let (verdict, record) = match result {
            Ok(validation) => {
                let record = OrderValidationRecord {
                    symbol: request.symbol.clone(),
                    decision_record_id,
                    outcome: if validation.should_open_order { "approved" } else { "rejected" }.into(),
                    should_open_order: validation.should_open_order,
                    confidence_percent: validation.confidence_percent,
                    justification: validation.justification.clone(),
                    request_data,
                    response_data: serde_json::to_string(&validation).unwrap_or_default(),
                    created_at: now,
                };
                if validation.should_open_order {
                    info!(
                        symbol = %request.symbol,
                        confidence = validation.confidence_percent,
                        "✅ Order approved by advisory"
                    );
                    *rejection = None;
                    (GateVerdict::Approved(validation), record)
                } else {
                    warn!(
                        symbol = %request.symbol,
                        confidence = validation.confidence_percent,
                        justification = %validation.justification,
                        "🚫 Order rejected by advisory"
                    );
                    *rejection = Some(Rejection { at: now, key: *key });
                    (GateVerdict::Rejected(validation), record)
                }
            }
            Err(e) => {
                warn!(symbol = %request.symbol, error = %e, "Order validation failed, proceeding");
                let record = OrderValidationRecord {
                    symbol: request.symbol.clone(),
                    decision_record_id,
                    outcome: "error".into(),
                    should_open_order: true,
                    confidence_percent: 0.0,
                    justification: e.to_string(),
                    request_data,
                    response_data: String::new(),
                    created_at: now,
                };
                (GateVerdict::FailedOpen(e.to_string()), record)
            }
        };

        if let Err(e) = self.store.append_order_validation(&record).await {
            warn!(symbol = %request.symbol, error = %e, "Failed to record order validation");
        }

        verdict
    }
}
