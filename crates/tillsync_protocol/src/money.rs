//! Money amounts and eventually consistent aggregates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};

/// An amount in minor currency units (centavos).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Zero.
    pub const ZERO: Money = Money(0);

    /// Creates an amount from minor units.
    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Creates an amount from whole currency units.
    pub const fn from_major(major: i64) -> Self {
        Self(major * 100)
    }

    /// Returns the amount in minor units.
    pub const fn minor(self) -> i64 {
        self.0
    }

    /// Multiplies a unit price by a quantity, `None` on overflow.
    pub fn checked_times(self, quantity: u32) -> Option<Money> {
        self.0.checked_mul(i64::from(quantity)).map(Money)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0.saturating_sub(rhs.0))
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

/// A monetary aggregate whose merge rule is carried by its type.
///
/// `Local` values were computed on the terminal; `pending` is set while the
/// mutation that produced them has not been acknowledged and confirmed by a
/// fresh remote read. `Confirmed` values came from the remote and are
/// trusted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregate {
    /// Computed locally.
    Local {
        /// Whether a remote read has yet to confirm this value.
        pending: bool,
        /// The amount.
        value: Money,
    },
    /// Taken from the remote.
    Confirmed(Money),
}

impl Aggregate {
    /// A freshly computed local value awaiting confirmation.
    pub const fn local(value: Money) -> Self {
        Aggregate::Local {
            pending: true,
            value,
        }
    }

    /// Returns the amount regardless of provenance.
    pub const fn value(&self) -> Money {
        match self {
            Aggregate::Local { value, .. } | Aggregate::Confirmed(value) => *value,
        }
    }

    /// Returns true while the value is flagged pending.
    pub const fn is_pending(&self) -> bool {
        matches!(self, Aggregate::Local { pending: true, .. })
    }

    /// Merges a remote value into this one.
    ///
    /// While the owning entity has an outstanding mutation the larger of the
    /// two values wins and the result stays pending, so a remote total that
    /// has not been recomputed yet cannot regress a newer local total. With
    /// nothing outstanding the remote value is authoritative.
    #[must_use]
    pub fn merge_remote(self, remote: Money, outstanding: bool) -> Self {
        if outstanding {
            Aggregate::local(self.value().max(remote))
        } else {
            Aggregate::Confirmed(remote)
        }
    }
}

impl Default for Aggregate {
    fn default() -> Self {
        Aggregate::Local {
            pending: false,
            value: Money::ZERO,
        }
    }
}
