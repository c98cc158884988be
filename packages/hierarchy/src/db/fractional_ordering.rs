//! Fractional order keys for sibling sequences
//!
//! Siblings are sorted by an `f64` key so that insertion never renumbers
//! existing children. Keys only need rebalancing after a very long run of
//! same-gap insertions exhausts float precision.

/// Gap below which a scope is considered precision-exhausted
pub const DEFAULT_REBALANCE_THRESHOLD: f64 = 0.0001;

/// Calculates the fractional order for inserting a node between two siblings
pub struct FractionalOrderCalculator;

impl FractionalOrderCalculator {
    /// Calculate order value for inserting between prev and next
    ///
    /// # Examples
    /// ```
    /// use nodespace_hierarchy::db::FractionalOrderCalculator;
    ///
    /// // First child of an empty scope
    /// assert_eq!(FractionalOrderCalculator::calculate_order(None, None), 1.0);
    /// // Before the first child
    /// assert_eq!(FractionalOrderCalculator::calculate_order(None, Some(1.0)), 0.0);
    /// // After the last child
    /// assert_eq!(FractionalOrderCalculator::calculate_order(Some(3.0), None), 4.0);
    /// // Between two siblings
    /// assert_eq!(FractionalOrderCalculator::calculate_order(Some(1.0), Some(2.0)), 1.5);
    /// ```
    pub fn calculate_order(prev_order: Option<f64>, next_order: Option<f64>) -> f64 {
        match (prev_order, next_order) {
            (None, None) => 1.0,                             // First child
            (None, Some(next)) => next - 1.0,                // Before first
            (Some(prev), None) => prev + 1.0,                // After last
            (Some(prev), Some(next)) => (prev + next) / 2.0, // Between siblings
        }
    }

    /// True when a computed key is not strictly between its neighbours
    ///
    /// Happens once the midpoint of two adjacent keys rounds to one of them.
    pub fn collides(candidate: f64, prev_order: Option<f64>, next_order: Option<f64>) -> bool {
        prev_order.is_some_and(|prev| candidate <= prev)
            || next_order.is_some_and(|next| candidate >= next)
    }

    /// Produce `count` increasing keys starting at `lower` and staying below `upper`
    ///
    /// Used when a block of siblings is spliced into a single slot (children
    /// promoted into the position of a deleted parent). Without an upper bound
    /// the keys are spaced by 1.0.
    pub fn spread_orders(lower: f64, upper: Option<f64>, count: usize) -> Vec<f64> {
        match upper {
            Some(upper) if upper > lower => {
                let step = (upper - lower) / count as f64;
                (0..count).map(|i| lower + step * i as f64).collect()
            }
            _ => (0..count).map(|i| lower + i as f64).collect(),
        }
    }

    /// Check if rebalancing is needed (gap too small)
    pub fn needs_rebalancing(orders: &[f64], threshold: f64) -> bool {
        orders.windows(2).any(|pair| pair[1] - pair[0] < threshold)
    }

    /// Rebalance orders to have even spacing
    ///
    /// # Example
    /// Input:  [1.0, 1.0001, 1.0002, 1.0003]
    /// Output: [1.0, 2.0, 3.0, 4.0]
    pub fn rebalance(count: usize) -> Vec<f64> {
        (1..=count).map(|i| i as f64).collect()
    }
}
