//! Aggregation functions used to consolidate points into time buckets.
//!
//! The same function is used in two places: it is pushed down into storage
//! queries when storage performs the downsampling, and it is applied locally
//! by [`PointStore::rollup`](crate::points::PointStore::rollup) when storage
//! returns raw points.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reduction applied to all points that fall into one bucket.
///
/// NaN values are ignored. An empty (or all-NaN) batch reduces to NaN.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationFn {
    /// Sum of all values.
    Sum,

    /// Arithmetic mean of all values.
    #[default]
    Average,

    /// Minimum value.
    Min,

    /// Maximum value.
    Max,

    /// First value in time order.
    First,

    /// Last value in time order.
    Last,
}

impl AggregationFn {
    /// Every supported function, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Sum,
        Self::Average,
        Self::Min,
        Self::Max,
        Self::First,
        Self::Last,
    ];

    /// Resolves a function from its configuration name.
    ///
    /// Accepts the canonical names plus the storage-side spellings
    /// (`avg`, `any`, `anyLast`).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use rollgate::aggregation::AggregationFn;
    ///
    /// assert_eq!(AggregationFn::from_name("avg"), Some(AggregationFn::Average));
    /// assert_eq!(AggregationFn::from_name("anyLast"), Some(AggregationFn::Last));
    /// assert_eq!(AggregationFn::from_name("median"), None);
    /// ```
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sum" => Some(Self::Sum),
            "avg" | "average" => Some(Self::Average),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "any" | "first" => Some(Self::First),
            "anyLast" | "last" => Some(Self::Last),
            _ => None,
        }
    }

    /// Canonical name reported to clients as the consolidation function.
    pub fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Average => "average",
            Self::Min => "min",
            Self::Max => "max",
            Self::First => "first",
            Self::Last => "last",
        }
    }

    /// Name of the equivalent aggregate in the storage query dialect.
    pub fn storage_name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Average => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::First => "any",
            Self::Last => "anyLast",
        }
    }

    /// Applies this function to a batch of values in time order.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use rollgate::aggregation::AggregationFn;
    ///
    /// let values = [1.0, 2.0, f64::NAN, 4.0];
    ///
    /// assert!((AggregationFn::Average.apply(&values) - 7.0 / 3.0).abs() < 1e-10);
    /// assert_eq!(AggregationFn::Min.apply(&values), 1.0);
    /// assert_eq!(AggregationFn::Max.apply(&values), 4.0);
    /// assert_eq!(AggregationFn::First.apply(&values), 1.0);
    /// assert_eq!(AggregationFn::Last.apply(&values), 4.0);
    /// assert_eq!(AggregationFn::Sum.apply(&values), 7.0);
    /// ```
    #[allow(clippy::cast_precision_loss)] // bucket sizes stay far below 2^52
    pub fn apply(self, values: &[f64]) -> f64 {
        let mut valid = values.iter().copied().filter(|v| !v.is_nan());

        let Some(first) = valid.next() else {
            return f64::NAN;
        };

        match self {
            Self::Sum => valid.fold(first, |acc, v| acc + v),
            Self::Average => {
                let (sum, count) = valid.fold((first, 1usize), |(s, c), v| (s + v, c + 1));
                sum / count as f64
            }
            Self::Min => valid.fold(first, f64::min),
            Self::Max => valid.fold(first, f64::max),
            Self::First => first,
            Self::Last => valid.last().unwrap_or(first),
        }
    }
}

impl fmt::Display for AggregationFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
