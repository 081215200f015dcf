//! Plan tiers sold by Kanjipress

use serde::{Deserialize, Serialize};

/// Subscription tier for a customer.
///
/// `Free` is the absence of a paid plan; `Plus` is the individual
/// subscription; `School` is the classroom license.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Plus,
    School,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Plus => "plus",
            PlanTier::School => "school",
        }
    }

    /// Parse a tier name; unknown names map to `Free`.
    pub fn from_str_or_free(s: &str) -> Self {
        match s {
            "plus" => PlanTier::Plus,
            "school" => PlanTier::School,
            _ => PlanTier::Free,
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, PlanTier::Free)
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_tiers() {
        for tier in [PlanTier::Free, PlanTier::Plus, PlanTier::School] {
            assert_eq!(PlanTier::from_str_or_free(tier.as_str()), tier);
        }
    }

    #[test]
    fn unknown_tier_falls_back_to_free() {
        assert_eq!(PlanTier::from_str_or_free("enterprise"), PlanTier::Free);
        assert!(!PlanTier::from_str_or_free("enterprise").is_paid());
    }
}
