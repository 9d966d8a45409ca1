//! Outlier-rejecting price aggregation
//!
//! Pure functions shared by both roles:
//! - `aggregate` folds one node's readings into an average, rejecting
//!   readings that drift too far from the previous average
//! - `aggregate_fleet` averages the per-node averages of a sweep

use crate::schema::TickerReading;

/// Aggregation failures surfaced to controllers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregationFault {
    /// Some readings drifted beyond the allowed delta.
    #[error("{0} reading(s) exceeded the delta threshold")]
    DeltaOverflow(usize),

    /// Every reading was rejected or faulted.
    #[error("no reading was accepted")]
    NoAcceptedReadings,

    /// Fleet average requested over zero nodes.
    #[error("fleet aggregation over an empty node set")]
    EmptyFleet,
}

/// Result of one `aggregate` call.
///
/// `rejected` is `None` only when nothing was rejected. An empty accepted
/// set always carries `Some`, even if the list itself is empty.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationOutcome {
    pub accepted_average: Option<f64>,
    pub rejected: Option<Vec<TickerReading>>,
}

impl AggregationOutcome {
    /// `Ok(average)` when the outcome may replace the running average.
    pub fn into_average(self) -> Result<f64, (AggregationFault, Vec<TickerReading>)> {
        match (self.accepted_average, self.rejected) {
            (Some(avg), None) => Ok(avg),
            (None, rejected) => Err((AggregationFault::NoAcceptedReadings, rejected.unwrap_or_default())),
            (Some(_), Some(rejected)) => Err((AggregationFault::DeltaOverflow(rejected.len()), rejected)),
        }
    }

    pub fn is_total_failure(&self) -> bool {
        self.accepted_average.is_none()
    }
}

/// Averages `readings`, rejecting outliers relative to `previous_average`.
///
/// A reading is rejected iff `|value - previous| > |previous * delta_max_fraction|`.
/// With `previous_average == 0` nothing can be rejected. Faulted readings
/// are skipped entirely.
pub fn aggregate(
    readings: &[TickerReading],
    previous_average: f64,
    delta_max_fraction: f64,
) -> AggregationOutcome {
    let delta_max = (previous_average * delta_max_fraction).abs();

    let mut sum = 0.0;
    let mut accepted = 0usize;
    let mut rejected = Vec::new();

    for reading in readings.iter().filter(|r| !r.is_faulted()) {
        let delta = if previous_average == 0.0 {
            0.0
        } else {
            reading.value - previous_average
        };

        if delta.abs() > delta_max {
            rejected.push(reading.clone());
        } else {
            sum += reading.value;
            accepted += 1;
        }
    }

    let accepted_average = (accepted > 0).then(|| sum / accepted as f64);

    let rejected = if rejected.is_empty() && accepted > 0 {
        None
    } else {
        Some(rejected)
    };

    AggregationOutcome { accepted_average, rejected }
}

/// Unweighted mean of per-node averages.
pub fn aggregate_fleet(per_node_averages: &[f64]) -> Result<f64, AggregationFault> {
    if per_node_averages.is_empty() {
        return Err(AggregationFault::EmptyFleet);
    }
    Ok(per_node_averages.iter().sum::<f64>() / per_node_averages.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FetchFault;

    fn reading(source: &str, value: f64) -> TickerReading {
        TickerReading {
            source: source.to_string(),
            symbol: "ETH/USD".to_string(),
            value,
            observed_at: 1,
            updated_at: 1,
            fault: None,
        }
    }

    #[test]
    fn rejects_reading_beyond_threshold() {
        let readings = vec![reading("a", 102.0), reading("b", 101.0), reading("c", 150.0)];
        let out = aggregate(&readings, 100.0, 0.2);

        assert_eq!(out.accepted_average, Some(101.5));
        let rejected = out.rejected.unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].source, "c");
    }

    #[test]
    fn partial_rejection_reports_overflow() {
        let readings = vec![reading("a", 100.0), reading("b", 300.0)];
        let out = aggregate(&readings, 100.0, 0.2);
        assert!(matches!(out.into_average(), Err((AggregationFault::DeltaOverflow(1), _))));
    }

    #[test]
    fn accepts_everything_within_threshold() {
        let readings = vec![reading("a", 99.0), reading("b", 110.0), reading("c", 91.0)];
        let out = aggregate(&readings, 100.0, 0.1);

        assert_eq!(out.rejected, None);
        assert_eq!(out.accepted_average, Some(100.0));
    }

    #[test]
    fn bootstrap_average_rejects_nothing() {
        let readings = vec![reading("a", 1.0), reading("b", 1_000_000.0)];
        let out = aggregate(&readings, 0.0, 0.2);

        assert_eq!(out.rejected, None);
        assert_eq!(out.accepted_average, Some(500_000.5));
    }

    #[test]
    fn all_rejected_is_a_distinct_failure() {
        let readings = vec![reading("a", 200.0), reading("b", 10.0)];
        let out = aggregate(&readings, 100.0, 0.2);

        assert!(out.is_total_failure());
        assert_eq!(out.rejected.as_ref().map(Vec::len), Some(2));
        assert!(matches!(out.into_average(), Err((AggregationFault::NoAcceptedReadings, r)) if r.len() == 2));
    }

    #[test]
    fn empty_input_yields_non_null_rejected() {
        let out = aggregate(&[], 100.0, 0.2);
        assert_eq!(out.accepted_average, None);
        assert_eq!(out.rejected, Some(vec![]));
    }

    #[test]
    fn faulted_readings_are_ignored() {
        let mut bad = reading("x", 9_999.0);
        bad.fault = Some(FetchFault::FetcherTimeout);
        let out = aggregate(&[bad, reading("a", 100.0)], 100.0, 0.2);

        assert_eq!(out.rejected, None);
        assert_eq!(out.accepted_average, Some(100.0));
    }

    #[test]
    fn fleet_mean_is_exact() {
        assert_eq!(aggregate_fleet(&[1.0, 2.0, 6.0]).unwrap(), (1.0 + 2.0 + 6.0) / 3.0);
        assert_eq!(aggregate_fleet(&[]), Err(AggregationFault::EmptyFleet));
    }
}
