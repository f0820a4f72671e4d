//! Per-strategy period return series.

use super::StrategyId;
use crate::error::DataError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A single period return.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReturnPoint {
    /// Period-end date.
    pub date: NaiveDate,
    /// Simple return over the period.
    pub value: f64,
}

impl ReturnPoint {
    /// Creates a new return point.
    #[must_use]
    pub const fn new(date: NaiveDate, value: f64) -> Self {
        Self { date, value }
    }
}

/// Ordered return history of one strategy.
///
/// Periods are unique and strictly chronological, and every value is finite.
/// Construction fails otherwise, so downstream estimators never re-check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawReturnSeries")]
pub struct ReturnSeries {
    strategy: StrategyId,
    points: Vec<ReturnPoint>,
}

#[derive(Deserialize)]
struct RawReturnSeries {
    strategy: StrategyId,
    points: Vec<ReturnPoint>,
}

impl TryFrom<RawReturnSeries> for ReturnSeries {
    type Error = DataError;

    fn try_from(raw: RawReturnSeries) -> Result<Self, Self::Error> {
        Self::new(raw.strategy, raw.points)
    }
}

impl ReturnSeries {
    /// Creates a validated series.
    pub fn new(strategy: StrategyId, points: Vec<ReturnPoint>) -> Result<Self, DataError> {
        for pair in points.windows(2) {
            let (prev, next) = (pair[0].date, pair[1].date);
            if next == prev {
                return Err(DataError::DuplicatePeriod {
                    strategy: strategy.to_string(),
                    date: next.to_string(),
                });
            }
            if next < prev {
                return Err(DataError::OutOfOrder {
                    strategy: strategy.to_string(),
                    date: next.to_string(),
                });
            }
        }
        if points.iter().any(|p| !p.value.is_finite()) {
            return Err(DataError::NonFinite {
                field: strategy.to_string(),
            });
        }
        Ok(Self { strategy, points })
    }

    /// Creates a validated series from `(date, return)` pairs.
    pub fn from_pairs(
        strategy: impl Into<StrategyId>,
        pairs: impl IntoIterator<Item = (NaiveDate, f64)>,
    ) -> Result<Self, DataError> {
        let points = pairs
            .into_iter()
            .map(|(date, value)| ReturnPoint::new(date, value))
            .collect();
        Self::new(strategy.into(), points)
    }

    /// Returns the owning strategy.
    #[must_use]
    pub fn strategy(&self) -> &StrategyId {
        &self.strategy
    }

    /// Returns the points, oldest first.
    #[must_use]
    pub fn points(&self) -> &[ReturnPoint] {
        &self.points
    }

    /// Returns the return values, oldest first.
    #[must_use]
    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    /// Number of periods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True if the series has no periods.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Last period-end date, if any.
    #[must_use]
    pub fn last_date(&self) -> Option<NaiveDate> {
        self.points.last().map(|p| p.date)
    }

    /// Keeps only the most recent `n` periods.
    #[must_use]
    pub fn tail(&self, n: usize) -> Self {
        let start = self.points.len().saturating_sub(n);
        Self {
            strategy: self.strategy.clone(),
            points: self.points[start..].to_vec(),
        }
    }

    /// Keeps only periods ending on or before `date`.
    #[must_use]
    pub fn up_to(&self, date: NaiveDate) -> Self {
        let end = self.points.partition_point(|p| p.date <= date);
        Self {
            strategy: self.strategy.clone(),
            points: self.points[..end].to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[test]
    fn test_rejects_duplicate_period() {
        let err = ReturnSeries::from_pairs("carry", [(day(1), 0.01), (day(1), 0.02)]).unwrap_err();
        assert!(matches!(err, DataError::DuplicatePeriod { .. }));
    }

    #[test]
    fn test_rejects_out_of_order() {
        let err = ReturnSeries::from_pairs("carry", [(day(2), 0.01), (day(1), 0.02)]).unwrap_err();
        assert!(matches!(err, DataError::OutOfOrder { .. }));
    }

    #[test]
    fn test_rejects_nan() {
        let err = ReturnSeries::from_pairs("carry", [(day(1), f64::NAN)]).unwrap_err();
        assert!(matches!(err, DataError::NonFinite { .. }));
    }

    #[test]
    fn test_tail_and_up_to() {
        let series = ReturnSeries::from_pairs(
            "carry",
            [(day(1), 0.01), (day(2), -0.02), (day(3), 0.03), (day(4), 0.0)],
        )
        .unwrap();

        let tail = series.tail(2);
        assert_eq!(tail.values(), vec![0.03, 0.0]);

        let cut = series.up_to(day(2));
        assert_eq!(cut.len(), 2);
        assert_eq!(cut.last_date(), Some(day(2)));

        assert_eq!(series.tail(10).len(), 4);
    }

    #[test]
    fn test_deserialize_validates() {
        let json = r#"{"strategy":"carry","points":[
            {"date":"2024-01-02","value":0.01},
            {"date":"2024-01-01","value":0.02}]}"#;
        assert!(serde_json::from_str::<ReturnSeries>(json).is_err());
    }
}
