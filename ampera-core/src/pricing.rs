//! Pricing resolver
//!
//! Maps (connector type, optional pricing group) to a price per kWh in
//! minor currency units. Lookup order: group override for the connector
//! type, then the global rule for the type, then the system default.
//! Resolution never fails; an unknown or malformed connector type prices
//! at the system default so pricing can never block a session from
//! starting.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::{ConnectorType, GroupId, Money};

/// System default price per kWh when no rule matches
pub const DEFAULT_PRICE_PER_KWH: Money = 2_000;

#[derive(Debug, Default)]
struct PricingTable {
    /// Global rules, keyed by connector type
    rules: HashMap<ConnectorType, Money>,
    /// Per-group overrides, keyed by (group, connector type)
    overrides: HashMap<(GroupId, ConnectorType), Money>,
}

/// Read-mostly price table. Mutation comes from the CRUD layer; resolution
/// is a pure function of the tables at call time.
#[derive(Debug)]
pub struct PricingResolver {
    default_price: Money,
    table: RwLock<PricingTable>,
}

impl PricingResolver {
    pub fn new(default_price: Money) -> Self {
        Self {
            default_price,
            table: RwLock::new(PricingTable::default()),
        }
    }

    /// Set the global rule for a connector type.
    pub fn set_rule(&self, connector_type: ConnectorType, price_per_kwh: Money) {
        self.table.write().rules.insert(connector_type, price_per_kwh);
    }

    /// Set a group-specific override for a connector type.
    pub fn set_group_override(
        &self,
        group: impl Into<GroupId>,
        connector_type: ConnectorType,
        price_per_kwh: Money,
    ) {
        self.table
            .write()
            .overrides
            .insert((group.into(), connector_type), price_per_kwh);
    }

    /// Resolve the price per kWh for a connector type and optional group.
    pub fn price_for(&self, connector_type: ConnectorType, group: Option<&str>) -> Money {
        let table = self.table.read();

        if let Some(group) = group {
            if let Some(price) = table.overrides.get(&(group.to_string(), connector_type)) {
                return *price;
            }
        }

        table
            .rules
            .get(&connector_type)
            .copied()
            .unwrap_or(self.default_price)
    }
}

impl Default for PricingResolver {
    fn default() -> Self {
        Self::new(DEFAULT_PRICE_PER_KWH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_order() {
        let pricing = PricingResolver::new(1_000);
        pricing.set_rule(ConnectorType::Ccs2, 2_500);
        pricing.set_group_override("fleet", ConnectorType::Ccs2, 1_800);

        // Group override wins
        assert_eq!(pricing.price_for(ConnectorType::Ccs2, Some("fleet")), 1_800);
        // No override for this group: global rule
        assert_eq!(pricing.price_for(ConnectorType::Ccs2, Some("other")), 2_500);
        // No group: global rule
        assert_eq!(pricing.price_for(ConnectorType::Ccs2, None), 2_500);
        // No rule at all: system default
        assert_eq!(pricing.price_for(ConnectorType::Chademo, None), 1_000);
    }

    #[test]
    fn test_unknown_type_prices_at_default() {
        let pricing = PricingResolver::new(1_000);
        pricing.set_rule(ConnectorType::Ccs2, 2_500);

        assert_eq!(pricing.price_for(ConnectorType::Unknown, None), 1_000);
        assert_eq!(pricing.price_for(ConnectorType::Unknown, Some("fleet")), 1_000);
    }
}
