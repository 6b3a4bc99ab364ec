// Unit definitions - what an account's balance is denominated in

use crate::identity::{NotaryId, NymId, UnitId};
use serde::{Deserialize, Serialize};

/// One component of a basket: `weight` units of `unit` per basket unit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasketComponent {
    pub unit: UnitId,
    pub weight: i64,
}

/// A unit backed by a fixed mix of other units held in notary reserves
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Basket {
    pub components: Vec<BasketComponent>,
    /// Exchanges must be whole multiples of this many basket units
    pub minimum_transfer: i64,
}

impl Basket {
    pub fn new(components: Vec<BasketComponent>, minimum_transfer: i64) -> Self {
        Self {
            components,
            minimum_transfer,
        }
    }

    /// A basket needs at least one component, positive weights, no
    /// repeated unit and a positive minimum transfer
    pub fn is_valid(&self) -> bool {
        if self.components.is_empty() || self.minimum_transfer <= 0 {
            return false;
        }
        let mut seen = std::collections::BTreeSet::new();
        self.components
            .iter()
            .all(|c| c.weight > 0 && seen.insert(c.unit))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDefinition {
    id: UnitId,
    issuer: NymId,
    notary: NotaryId,
    name: String,
    basket: Option<Basket>,
}

impl UnitDefinition {
    /// Plain unit; the id is derived from the issuer, notary and name
    pub fn new(issuer: NymId, notary: NotaryId, name: impl Into<String>) -> Self {
        let name = name.into();
        let id = UnitId::derive(&[issuer.as_key(), notary.as_bytes(), name.as_bytes()]);
        Self {
            id,
            issuer,
            notary,
            name,
            basket: None,
        }
    }

    pub fn basket(issuer: NymId, notary: NotaryId, name: impl Into<String>, basket: Basket) -> Self {
        let mut unit = Self::new(issuer, notary, name);
        unit.basket = Some(basket);
        unit
    }

    pub fn id(&self) -> &UnitId {
        &self.id
    }

    pub fn issuer(&self) -> &NymId {
        &self.issuer
    }

    pub fn notary(&self) -> &NotaryId {
        &self.notary
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn basket_definition(&self) -> Option<&Basket> {
        self.basket.as_ref()
    }

    pub fn is_basket(&self) -> bool {
        self.basket.is_some()
    }
}
