// src/kanon/mod.rs
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use tracing::{debug, info};

use crate::error::{AnonError, AnonResult};

/// Generalised rows with named columns; every cell is a string.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Dataset {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of one column, top to bottom.
    pub fn column(&self, name: &str) -> Option<impl Iterator<Item = &str>> {
        let i = self.column_index(name)?;
        Some(self.rows.iter().map(move |r| r[i].as_str()))
    }
}

/// k-anonymity level. An empty input has no groups and therefore no k.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KLevel {
    Undefined,
    Level(usize),
}

impl KLevel {
    pub fn value(&self) -> Option<usize> {
        match self {
            KLevel::Undefined => None,
            KLevel::Level(k) => Some(*k),
        }
    }
}

impl fmt::Display for KLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KLevel::Undefined => f.write_str("undefined"),
            KLevel::Level(k) => write!(f, "{}", k),
        }
    }
}

/// Records sharing one quasi-identifier combination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    pub key: Vec<String>,
    pub size: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KReport {
    pub quasi_identifiers: Vec<String>,
    /// Groups ordered by key.
    pub groups: Vec<Group>,
    pub k: KLevel,
    /// Rows left out by exclusions.
    pub excluded: usize,
}

impl KReport {
    /// Caller-side threshold check. An undefined k never satisfies a threshold.
    pub fn satisfies(&self, threshold: usize) -> bool {
        self.k.value().is_some_and(|k| k >= threshold)
    }

    pub fn below(&self, threshold: usize) -> Vec<&Group> {
        self.groups.iter().filter(|g| g.size < threshold).collect()
    }
}

/// Whether rows whose postcode could not be resolved take part in grouping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedPolicy {
    /// The sentinel is an ordinary category.
    #[default]
    Category,
    /// Rows carrying the sentinel are left out of the calculation.
    Exclude,
}

/// Rows where `column == value` are skipped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exclusion {
    pub column: String,
    pub value: String,
}

/// Partition `data` by exactly the `quasi_identifiers` columns and report
/// each group's size plus the minimum. No threshold is enforced here.
#[tracing::instrument(level = "info", skip(data, exclusions), fields(rows = data.len()))]
pub fn verify(
    data: &Dataset,
    quasi_identifiers: &[String],
    exclusions: &[Exclusion],
) -> AnonResult<KReport> {
    let lookup = |name: &str| {
        data.column_index(name)
            .ok_or_else(|| AnonError::Schema(format!("unknown quasi-identifier `{}`", name)))
    };
    let qi_idx = quasi_identifiers
        .iter()
        .map(|q| lookup(q))
        .collect::<AnonResult<Vec<_>>>()?;
    let excl_idx = exclusions
        .iter()
        .map(|e| lookup(&e.column).map(|i| (i, e.value.as_str())))
        .collect::<AnonResult<Vec<_>>>()?;

    let mut counts: BTreeMap<Vec<&str>, usize> = BTreeMap::new();
    let mut excluded = 0;
    for row in &data.rows {
        if excl_idx.iter().any(|(i, v)| row[*i] == *v) {
            excluded += 1;
            continue;
        }
        let key: Vec<&str> = qi_idx.iter().map(|&i| row[i].as_str()).collect();
        *counts.entry(key).or_insert(0) += 1;
    }

    let groups: Vec<Group> = counts
        .into_iter()
        .map(|(key, size)| Group {
            key: key.into_iter().map(str::to_string).collect(),
            size,
        })
        .collect();
    let k = groups
        .iter()
        .map(|g| g.size)
        .min()
        .map_or(KLevel::Undefined, KLevel::Level);

    debug!(groups = groups.len(), excluded, "grouped rows");
    info!(k = %k, "k-anonymity computed");
    Ok(KReport {
        quasi_identifiers: quasi_identifiers.to_vec(),
        groups,
        k,
        excluded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qis(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn dataset(rows: &[[&str; 3]]) -> Dataset {
        Dataset {
            columns: qis(&["gender", "banded_age", "postcode_region"]),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|s| s.to_string()).collect())
                .collect(),
        }
    }

    #[test]
    fn test_identical_rows_form_one_group() {
        let data = dataset(&[["female", "(20, 40]", "1"]; 7]);
        let report = verify(&data, &qis(&["gender", "banded_age"]), &[]).unwrap();
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].size, 7);
        assert_eq!(report.k, KLevel::Level(7));
    }

    #[test]
    fn test_distinct_rows_give_k_one() {
        let data = dataset(&[
            ["female", "(0, 20]", "1"],
            ["female", "(20, 40]", "1"],
            ["male", "(20, 40]", "1"],
        ]);
        let report = verify(&data, &qis(&["gender", "banded_age"]), &[]).unwrap();
        assert_eq!(report.groups.len(), 3);
        assert!(report.groups.iter().all(|g| g.size == 1));
        assert_eq!(report.k, KLevel::Level(1));
        assert_eq!(report.below(2).len(), 3);
    }

    #[test]
    fn test_empty_is_undefined_not_zero() {
        let data = dataset(&[]);
        let report = verify(&data, &qis(&["gender"]), &[]).unwrap();
        assert_eq!(report.k, KLevel::Undefined);
        assert_eq!(report.k.to_string(), "undefined");
        assert!(!report.satisfies(0));
    }

    #[test]
    fn test_only_declared_columns_group() {
        let data = dataset(&[
            ["female", "(20, 40]", "1"],
            ["female", "(20, 40]", "2"],
            ["male", "(40, 60]", "2"],
        ]);
        let report = verify(&data, &qis(&["gender", "banded_age"]), &[]).unwrap();
        assert_eq!(report.groups.len(), 2);
        assert_eq!(report.groups[0].key, vec!["female", "(20, 40]"]);
        assert_eq!(report.groups[0].size, 2);
        assert_eq!(report.k, KLevel::Level(1));
    }

    #[test]
    fn test_exclusion_skips_sentinel_rows() {
        let data = dataset(&[
            ["female", "(20, 40]", "0"],
            ["female", "(20, 40]", "1"],
            ["female", "(20, 40]", "1"],
        ]);
        let qi = qis(&["gender", "postcode_region"]);

        let counted = verify(&data, &qi, &[]).unwrap();
        assert_eq!(counted.k, KLevel::Level(1));

        let exclusion = Exclusion {
            column: "postcode_region".into(),
            value: "0".into(),
        };
        let skipped = verify(&data, &qi, &[exclusion]).unwrap();
        assert_eq!(skipped.k, KLevel::Level(2));
        assert_eq!(skipped.excluded, 1);
    }

    #[test]
    fn test_unknown_column_is_schema_error() {
        let data = dataset(&[["female", "(20, 40]", "1"]]);
        let err = verify(&data, &qis(&["height"]), &[]).unwrap_err();
        assert!(matches!(err, AnonError::Schema(_)));
    }
}
