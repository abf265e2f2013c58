//! Plan catalog: maps billing-provider price ids to plans.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::Plan;

/// How a price id resolved against the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanResolution {
    /// The price id belongs to a configured plan.
    Matched(Plan),
    /// The price id is unknown (or missing); treated as basic with no grant.
    Unmatched,
}

impl PlanResolution {
    /// Plan to apply: the matched plan, or basic when unmatched.
    #[must_use]
    pub const fn plan(self) -> Plan {
        match self {
            Self::Matched(plan) => plan,
            Self::Unmatched => Plan::Basic,
        }
    }
}

/// Price ids configured for each paid plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanCatalog {
    price_ids: HashMap<String, Plan>,
}

impl PlanCatalog {
    /// Build a catalog from optional per-plan price ids.
    #[must_use]
    pub fn new(
        basic_price_id: Option<String>,
        pro_price_id: Option<String>,
        premium_price_id: Option<String>,
    ) -> Self {
        let price_ids = [
            (basic_price_id, Plan::Basic),
            (pro_price_id, Plan::Pro),
            (premium_price_id, Plan::Premium),
        ]
        .into_iter()
        .filter_map(|(id, plan)| id.filter(|id| !id.is_empty()).map(|id| (id, plan)))
        .collect();

        Self { price_ids }
    }

    /// Register a price id for a plan.
    #[must_use]
    pub fn with_price(mut self, price_id: impl Into<String>, plan: Plan) -> Self {
        self.price_ids.insert(price_id.into(), plan);
        self
    }

    /// Resolve a price id to a plan.
    #[must_use]
    pub fn resolve(&self, price_id: Option<&str>) -> PlanResolution {
        price_id
            .and_then(|id| self.price_ids.get(id))
            .map_or(PlanResolution::Unmatched, |plan| {
                PlanResolution::Matched(*plan)
            })
    }

    /// Number of configured price ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.price_ids.len()
    }

    /// Whether no price ids are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.price_ids.is_empty()
    }
}
