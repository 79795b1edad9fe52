use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use waypost_core::UsageRecordId;

use crate::plan::{MetricPrice, PushMode};
use crate::usage::UsageLedgerRecord;

/// What to do with one unbilled record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PushPlan {
    Push { quantity: u64, unit_price: Decimal },
    /// Fully covered by the included quota.
    Skip,
}

impl PushPlan {
    /// Units this plan bills.
    pub fn quantity(&self) -> u64 {
        match self {
            PushPlan::Push { quantity, .. } => *quantity,
            PushPlan::Skip => 0,
        }
    }
}

/// Split a period's unbilled records of one (tenant, metric) into pushes.
///
/// `quota_consumed` is the part of the included quota already absorbed by
/// planned records of the same period, settled or not. A record planned by an
/// earlier run keeps its `planned_quantity`; unplanned records take what is
/// left of the quota in `(occurred_at, id)` order.
pub fn plan_pushes(
    mode: PushMode,
    price: &MetricPrice,
    quota_consumed: u64,
    unbilled: &[UsageLedgerRecord],
) -> Vec<(UsageRecordId, PushPlan)> {
    let mut ordered: Vec<&UsageLedgerRecord> = unbilled.iter().filter(|r| !r.billed).collect();
    ordered.sort_by_key(|r| (r.occurred_at, r.id));

    match mode {
        PushMode::Shadow => ordered
            .into_iter()
            .map(|r| {
                (
                    r.id,
                    PushPlan::Push {
                        quantity: r.quantity,
                        unit_price: Decimal::ZERO,
                    },
                )
            })
            .collect(),
        PushMode::Real => {
            let mut free = price.included.saturating_sub(quota_consumed);
            ordered
                .into_iter()
                .map(|r| {
                    let billable = match r.planned_quantity {
                        Some(planned) => planned,
                        None => {
                            let covered = free.min(r.quantity);
                            free -= covered;
                            r.quantity - covered
                        }
                    };
                    let plan = if billable == 0 {
                        PushPlan::Skip
                    } else {
                        PushPlan::Push {
                            quantity: billable,
                            unit_price: price.unit_price,
                        }
                    };
                    (r.id, plan)
                })
                .collect()
        }
    }
}

/// Total quantity pushed by a plan.
pub fn pushed_quantity(plans: &[(UsageRecordId, PushPlan)]) -> u64 {
    plans
        .iter()
        .map(|(_, p)| p.quantity())
        .sum()
}
