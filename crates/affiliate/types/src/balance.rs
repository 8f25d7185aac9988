use serde::{Deserialize, Serialize};

/// Three-part affiliate balance in minor currency units.
///
/// `lifetime` only ever grows; `pending` and `available` move commissions
/// through the clearing window and into payouts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub pending_minor: u64,
    pub available_minor: u64,
    pub lifetime_minor: u64,
}

/// A single ledger event applied to a [`Balance`].
///
/// Every commission event maps to exactly one movement, and every movement is
/// an increment relative to the stored value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BalanceMovement {
    /// Conversion: `pending += amount`, `lifetime += amount`.
    Accrue { amount_minor: u64 },
    /// Clearing: `pending -= amount`, `available += amount`.
    Clear { amount_minor: u64 },
    /// Payout creation: `available -= amount`.
    Disburse { amount_minor: u64 },
}

impl BalanceMovement {
    pub fn amount_minor(&self) -> u64 {
        match self {
            Self::Accrue { amount_minor }
            | Self::Clear { amount_minor }
            | Self::Disburse { amount_minor } => *amount_minor,
        }
    }
}

/// Result of applying a movement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceApplied {
    pub balance: Balance,
    /// Portion of a decrement that would have driven a counter below zero.
    pub clamped_minor: u64,
}

impl BalanceApplied {
    pub fn was_clamped(&self) -> bool {
        self.clamped_minor > 0
    }
}

impl Balance {
    /// Apply a movement, saturating decrements at zero.
    pub fn apply(self, movement: BalanceMovement) -> BalanceApplied {
        let mut next = self;
        let mut clamped_minor = 0;
        match movement {
            BalanceMovement::Accrue { amount_minor } => {
                next.pending_minor = next.pending_minor.saturating_add(amount_minor);
                next.lifetime_minor = next.lifetime_minor.saturating_add(amount_minor);
            }
            BalanceMovement::Clear { amount_minor } => {
                clamped_minor = amount_minor.saturating_sub(next.pending_minor);
                next.pending_minor = next.pending_minor.saturating_sub(amount_minor);
                next.available_minor = next.available_minor.saturating_add(amount_minor);
            }
            BalanceMovement::Disburse { amount_minor } => {
                clamped_minor = amount_minor.saturating_sub(next.available_minor);
                next.available_minor = next.available_minor.saturating_sub(amount_minor);
            }
        }
        BalanceApplied {
            balance: next,
            clamped_minor,
        }
    }

    /// `pending + available`, the amount not yet disbursed.
    pub fn outstanding_minor(&self) -> u64 {
        self.pending_minor.saturating_add(self.available_minor)
    }
}
