use std::collections::HashMap;

use crate::error::{AnonError, AnonResult};

/// Many-to-one mapping from raw categories to coarser ones.
/// Values outside the table fail unless an explicit default is set.
#[derive(Clone, Debug, Default)]
pub struct CollapseTable {
    order: Vec<(String, String)>,
    lookup: HashMap<String, String>,
    default: Option<String>,
}

impl CollapseTable {
    pub fn new<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut table = Self::default();
        for (raw, coarse) in pairs {
            let (raw, coarse) = (raw.into(), coarse.into());
            if table.lookup.insert(raw.clone(), coarse.clone()).is_none() {
                table.order.push((raw, coarse));
            }
        }
        table
    }

    /// Catch-all category for values absent from the table.
    pub fn with_default(mut self, category: impl Into<String>) -> Self {
        self.default = Some(category.into());
        self
    }

    pub fn collapse<'a>(&'a self, field: &str, value: &str) -> AnonResult<&'a str> {
        self.lookup
            .get(value)
            .or(self.default.as_ref())
            .map(String::as_str)
            .ok_or_else(|| AnonError::missing(field, value))
    }

    /// Distinct output categories, first-seen order, default last.
    pub fn categories(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        let tail = self.default.iter().map(String::as_str);
        for c in self.order.iter().map(|(_, c)| c.as_str()).chain(tail) {
            if !out.contains(&c) {
                out.push(c);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn education() -> CollapseTable {
        CollapseTable::new([
            ("primary", "compulsory"),
            ("secondary", "compulsory"),
            ("bachelor", "undergraduate"),
            ("masters", "postgraduate"),
            ("phD", "postgraduate"),
            ("other", "other"),
        ])
    }

    #[test]
    fn test_collapse_many_to_one() {
        let t = education();
        assert_eq!(t.collapse("education_level", "primary").unwrap(), "compulsory");
        assert_eq!(t.collapse("education_level", "phD").unwrap(), "postgraduate");
        assert_eq!(
            t.categories(),
            vec!["compulsory", "undergraduate", "postgraduate", "other"]
        );
    }

    #[test]
    fn test_missing_value_names_field_and_value() {
        let err = education().collapse("education_level", "doctorate").unwrap_err();
        match err {
            AnonError::MissingMapping { field, value } => {
                assert_eq!(field, "education_level");
                assert_eq!(value, "doctorate");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_explicit_default_branch() {
        let t = education().with_default("other");
        assert_eq!(t.collapse("education_level", "doctorate").unwrap(), "other");
        assert_eq!(t.categories().last(), Some(&"other"));
    }
}
