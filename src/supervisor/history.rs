use std::collections::VecDeque;

use crate::schema::FleetPricePoint;

/// Entries kept in the fleet price history.
pub const HISTORY_CAP: usize = 10;

/// Rolling record of fleet averages, oldest first.
#[derive(Debug, Default, Clone)]
pub struct FleetPriceHistory {
    points: VecDeque<FleetPricePoint>,
}

impl FleetPriceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a point unless the last one carries the same timestamp.
    ///
    /// `delta_percent` is relative to the previous entry (0 for the first).
    /// Returns `false` when the point was skipped.
    pub fn record(&mut self, price: f64, observed_at: i64) -> bool {
        let delta_percent = match self.points.back() {
            Some(last) if last.observed_at == observed_at => return false,
            Some(last) if last.price != 0.0 => (price - last.price) / last.price * 100.0,
            _ => 0.0,
        };

        self.points.push_back(FleetPricePoint { price, observed_at, delta_percent });
        while self.points.len() > HISTORY_CAP {
            self.points.pop_front();
        }
        true
    }

    pub fn last(&self) -> Option<&FleetPricePoint> {
        self.points.back()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn to_vec(&self) -> Vec<FleetPricePoint> {
        self.points.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_beyond_cap() {
        let mut history = FleetPriceHistory::new();
        for i in 0..15 {
            assert!(history.record(100.0 + i as f64, i));
        }

        assert_eq!(history.len(), HISTORY_CAP);
        let points = history.to_vec();
        assert_eq!(points[0].observed_at, 5);
        assert_eq!(points[9].observed_at, 14);
    }

    #[test]
    fn same_timestamp_is_skipped() {
        let mut history = FleetPriceHistory::new();
        assert!(history.record(100.0, 7));
        assert!(!history.record(200.0, 7));
        assert_eq!(history.len(), 1);
        assert_eq!(history.last().unwrap().price, 100.0);
    }

    #[test]
    fn delta_is_percent_of_previous() {
        let mut history = FleetPriceHistory::new();
        history.record(100.0, 1);
        history.record(110.0, 2);

        let points = history.to_vec();
        assert_eq!(points[0].delta_percent, 0.0);
        assert!((points[1].delta_percent - 10.0).abs() < 1e-9);
    }
}
