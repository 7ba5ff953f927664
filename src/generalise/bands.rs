// src/generalise/bands.rs
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{AnonError, AnonResult};

/// What to do with a value that no band contains (including missing cells).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangePolicy {
    /// Fail the run with `AnonError::Range`.
    Reject,
    /// Emit the sentinel band and count the row.
    #[default]
    Sentinel,
}

/// Strictly increasing edges `e0 < e1 < … < en` describing the
/// right-closed intervals `(e[i], e[i+1]]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Bins {
    edges: Vec<f64>,
}

impl Bins {
    pub fn new(edges: impl Into<Vec<f64>>) -> AnonResult<Self> {
        let edges = edges.into();
        if edges.len() < 2 {
            return Err(AnonError::Schema(format!(
                "bins need at least two edges, got {:?}",
                edges
            )));
        }
        if edges.iter().any(|e| !e.is_finite()) || edges.windows(2).any(|w| w[0] >= w[1]) {
            return Err(AnonError::Schema(format!(
                "bin edges must be finite and strictly increasing: {:?}",
                edges
            )));
        }
        Ok(Self { edges })
    }

    /// Number of intervals.
    pub fn len(&self) -> usize {
        self.edges.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Index of the interval containing `v`; the lowest edge itself is outside.
    pub fn index_of(&self, v: f64) -> Option<usize> {
        let first = self.edges[0];
        let last = self.edges[self.edges.len() - 1];
        if v.is_nan() || v <= first || v > last {
            return None;
        }
        // count of edges strictly below v; at least 1 because v > first
        Some(self.edges.partition_point(|e| *e < v) - 1)
    }

    /// `(a, b]` rendering of interval `i`.
    pub fn label(&self, i: usize) -> String {
        format!("({}, {}]", self.edges[i], self.edges[i + 1])
    }

    pub fn labels(&self) -> Vec<String> {
        (0..self.len()).map(|i| self.label(i)).collect()
    }

    pub fn band(&self, v: f64) -> Option<String> {
        self.index_of(v).map(|i| self.label(i))
    }
}

/// Bins with one human-readable tier name per interval.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelledBins {
    bins: Bins,
    labels: Vec<String>,
}

impl LabelledBins {
    pub fn new<S: Into<String>>(
        edges: impl Into<Vec<f64>>,
        labels: impl IntoIterator<Item = S>,
    ) -> AnonResult<Self> {
        let bins = Bins::new(edges)?;
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        if labels.len() != bins.len() {
            return Err(AnonError::Schema(format!(
                "{} labels for {} intervals",
                labels.len(),
                bins.len()
            )));
        }
        Ok(Self { bins, labels })
    }

    pub fn bins(&self) -> &Bins {
        &self.bins
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn band(&self, v: f64) -> Option<&str> {
        self.bins.index_of(v).map(|i| self.labels[i].as_str())
    }
}

/// Whole years between the birth year and the reference year; month and day are ignored.
pub fn age_in_years(birth: NaiveDate, reference: NaiveDate) -> i32 {
    reference.year() - birth.year()
}
