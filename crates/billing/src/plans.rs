//! Static plan catalog
//!
//! Maps configured Stripe price ids to plan names and tiers. The catalog is
//! used for validating `invoice.paid` price matches and for email content;
//! nothing in this engine mutates it.

use kanjipress_shared::PlanTier;

use crate::client::PriceIds;

/// A purchasable plan.
#[derive(Debug, Clone)]
pub struct Plan {
    pub price_id: String,
    pub name: String,
    pub tier: PlanTier,
}

/// Catalog of all configured plans.
#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    plans: Vec<Plan>,
}

impl PlanCatalog {
    pub fn from_price_ids(price_ids: &PriceIds) -> Self {
        let mut plans = Vec::new();

        let mut add = |price_id: &Option<String>, name: &str, tier: PlanTier| {
            if let Some(price_id) = price_id {
                plans.push(Plan {
                    price_id: price_id.clone(),
                    name: name.to_string(),
                    tier,
                });
            }
        };

        add(&price_ids.plus_monthly, "Kanjipress Plus (monthly)", PlanTier::Plus);
        add(&price_ids.plus_annual, "Kanjipress Plus (annual)", PlanTier::Plus);
        add(
            &price_ids.school_monthly,
            "Kanjipress School (monthly)",
            PlanTier::School,
        );
        add(
            &price_ids.school_annual,
            "Kanjipress School (annual)",
            PlanTier::School,
        );

        Self { plans }
    }

    pub fn resolve(&self, price_id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.price_id == price_id)
    }

    /// Display name for a price id; falls back to the raw id for prices that
    /// predate the current configuration.
    pub fn plan_name(&self, price_id: &str) -> String {
        self.resolve(price_id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| price_id.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}
