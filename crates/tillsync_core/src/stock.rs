//! Stock reservation collaborator.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Reserves stock when items are added and releases it when they are
/// reduced, removed or voided.
///
/// A failed reservation aborts the intent before anything is written.
pub trait StockReservations: Send + Sync {
    /// Reserves `quantity` units.
    ///
    /// # Errors
    ///
    /// Returns `StockUnavailable` if fewer units are available.
    fn reserve(&self, product_id: &str, quantity: u32) -> CoreResult<()>;

    /// Returns `quantity` previously reserved units.
    fn release(&self, product_id: &str, quantity: u32);

    /// Units currently available, `None` if the product is not tracked.
    fn current_available(&self, product_id: &str) -> Option<u32>;
}

/// Never refuses a reservation.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedStock;

impl StockReservations for UnlimitedStock {
    fn reserve(&self, _product_id: &str, _quantity: u32) -> CoreResult<()> {
        Ok(())
    }

    fn release(&self, _product_id: &str, _quantity: u32) {}

    fn current_available(&self, _product_id: &str) -> Option<u32> {
        None
    }
}

/// Counts stock in memory. Untracked products are unlimited.
#[derive(Debug, Default)]
pub struct InMemoryStock {
    levels: Mutex<HashMap<String, u32>>,
}

impl InMemoryStock {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a product with `available` units.
    #[must_use]
    pub fn with_product(self, product_id: impl Into<String>, available: u32) -> Self {
        self.levels.lock().insert(product_id.into(), available);
        self
    }
}

impl StockReservations for InMemoryStock {
    fn reserve(&self, product_id: &str, quantity: u32) -> CoreResult<()> {
        let mut levels = self.levels.lock();
        let Some(available) = levels.get_mut(product_id) else {
            return Ok(());
        };
        if *available < quantity {
            return Err(CoreError::StockUnavailable {
                product_id: product_id.to_string(),
                requested: quantity,
                available: *available,
            });
        }
        *available -= quantity;
        Ok(())
    }

    fn release(&self, product_id: &str, quantity: u32) {
        if let Some(available) = self.levels.lock().get_mut(product_id) {
            *available = available.saturating_add(quantity);
        }
    }

    fn current_available(&self, product_id: &str) -> Option<u32> {
        self.levels.lock().get(product_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_release() {
        let stock = InMemoryStock::new().with_product("beer", 3);
        stock.reserve("beer", 2).unwrap();
        assert_eq!(stock.current_available("beer"), Some(1));

        let err = stock.reserve("beer", 2).unwrap_err();
        assert!(matches!(err, CoreError::StockUnavailable { available: 1, .. }));

        stock.release("beer", 2);
        assert_eq!(stock.current_available("beer"), Some(3));
        assert!(stock.reserve("water", 1_000).is_ok());
        assert_eq!(stock.current_available("water"), None);
    }
}
