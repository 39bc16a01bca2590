use crate::models::{PriceMode, Sku};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use thiserror::Error;

pub const FIXED_STRATEGY_ID: &str = "fixed";
/// Selected when the operator returns to strategy mode from manual pricing.
pub const DEFAULT_STRATEGY_ID: &str = "up_10";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("unknown price strategy `{0}`")]
    UnknownStrategy(String),
    #[error("the `fixed` strategy has no transform; prices are entered manually")]
    FixedNotApplicable,
    #[error("price must not be negative")]
    NegativePrice,
    #[error("unknown sku `{0}`")]
    UnknownSku(String),
}

#[derive(Clone, Copy, Serialize)]
pub struct PriceStrategy {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    #[serde(skip)]
    transform: fn(Decimal) -> Decimal,
}

impl PriceStrategy {
    pub fn is_fixed(&self) -> bool {
        self.id == FIXED_STRATEGY_ID
    }

    pub fn price_for(&self, original: Decimal) -> Decimal {
        round2((self.transform)(original))
    }
}

impl std::fmt::Debug for PriceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceStrategy").field("id", &self.id).finish()
    }
}

pub const STRATEGIES: [PriceStrategy; 7] = [
    PriceStrategy {
        id: FIXED_STRATEGY_ID,
        name: "Fixed",
        description: "Enter prices manually",
        transform: identity,
    },
    PriceStrategy {
        id: "up_10",
        name: "Raise 10%",
        description: "Original price plus 10%",
        transform: up_10,
    },
    PriceStrategy {
        id: "up_20",
        name: "Raise 20%",
        description: "Original price plus 20%",
        transform: up_20,
    },
    PriceStrategy {
        id: "up_30",
        name: "Raise 30%",
        description: "Original price plus 30%",
        transform: up_30,
    },
    PriceStrategy {
        id: "down_10",
        name: "Lower 10%",
        description: "Original price minus 10%",
        transform: down_10,
    },
    PriceStrategy {
        id: "round_9",
        name: "Round to .9",
        description: "Round up to the next integer, then subtract 0.1 (40 -> 39.9)",
        transform: round_9,
    },
    PriceStrategy {
        id: "up_10_round_9",
        name: "Raise 10% then round to .9",
        description: "Add 10%, round up to the next integer, then subtract 0.1",
        transform: up_10_round_9,
    },
];

pub fn strategy(id: &str) -> Option<&'static PriceStrategy> {
    STRATEGIES.iter().find(|s| s.id == id)
}

fn identity(price: Decimal) -> Decimal {
    price
}

fn scale(price: Decimal, percent: i64) -> Decimal {
    price * Decimal::new(100 + percent, 2)
}

fn up_10(price: Decimal) -> Decimal {
    scale(price, 10)
}

fn up_20(price: Decimal) -> Decimal {
    scale(price, 20)
}

fn up_30(price: Decimal) -> Decimal {
    scale(price, 30)
}

fn down_10(price: Decimal) -> Decimal {
    scale(price, -10)
}

fn round_9(price: Decimal) -> Decimal {
    price.ceil() - Decimal::new(1, 1)
}

fn up_10_round_9(price: Decimal) -> Decimal {
    round_9(up_10(price))
}

/// Round half up to two decimal places.
pub fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Recomputes every SKU price from its original price, enabled or not.
/// Earlier manual edits are overwritten.
pub fn apply_strategy(strategy_id: &str, skus: &[Sku]) -> Result<Vec<Sku>, PricingError> {
    let strategy =
        strategy(strategy_id).ok_or_else(|| PricingError::UnknownStrategy(strategy_id.into()))?;
    if strategy.is_fixed() {
        return Err(PricingError::FixedNotApplicable);
    }
    Ok(skus
        .iter()
        .map(|sku| Sku {
            price: Some(strategy.price_for(sku.original_price)),
            ..sku.clone()
        })
        .collect())
}

/// Percentage difference between the sale price and the original price.
pub fn price_delta(sku: &Sku) -> Option<Decimal> {
    let price = sku.price?;
    if sku.original_price.is_zero() {
        return None;
    }
    price
        .checked_sub(sku.original_price)?
        .checked_div(sku.original_price)?
        .checked_mul(Decimal::ONE_HUNDRED)
}

/// Price mode and strategy selection of a session.
#[derive(Debug, Clone, Serialize)]
pub struct PricingState {
    pub mode: PriceMode,
    pub strategy_id: String,
}

impl Default for PricingState {
    fn default() -> Self {
        Self {
            mode: PriceMode::Strategy,
            strategy_id: DEFAULT_STRATEGY_ID.to_string(),
        }
    }
}

impl PricingState {
    pub fn set_mode(&mut self, mode: PriceMode) {
        self.mode = mode;
        match mode {
            PriceMode::Fixed => self.strategy_id = FIXED_STRATEGY_ID.to_string(),
            PriceMode::Strategy if self.strategy_id == FIXED_STRATEGY_ID => {
                self.strategy_id = DEFAULT_STRATEGY_ID.to_string();
            }
            PriceMode::Strategy => {}
        }
    }

    /// Applies `strategy_id` to `skus` and records it as the active strategy.
    pub fn select(&mut self, strategy_id: &str, skus: &mut Vec<Sku>) -> Result<(), PricingError> {
        let priced = apply_strategy(strategy_id, skus)?;
        *skus = priced;
        self.mode = PriceMode::Strategy;
        self.strategy_id = strategy_id.to_string();
        Ok(())
    }
}
