use std::collections::HashMap;

use crate::error::{AnonError, AnonResult};

/// Bijective (token, original) table exported alongside the dataset.
#[derive(Clone, Debug)]
pub struct KeyTable {
    name: String,
    token_header: String,
    original_header: String,
    pairs: Vec<(String, String)>,
    by_original: HashMap<String, usize>,
    by_token: HashMap<String, usize>,
}

impl KeyTable {
    pub fn new<T, O>(
        name: &str,
        headers: (&str, &str),
        pairs: impl IntoIterator<Item = (T, O)>,
    ) -> AnonResult<Self>
    where
        T: Into<String>,
        O: Into<String>,
    {
        let pairs: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(t, o)| (t.into(), o.into()))
            .collect();
        let mut by_original = HashMap::with_capacity(pairs.len());
        let mut by_token = HashMap::with_capacity(pairs.len());

        for (i, (token, original)) in pairs.iter().enumerate() {
            if by_token.insert(token.clone(), i).is_some() {
                return Err(AnonError::ExportIntegrity(format!(
                    "key table `{}` repeats token {:?}",
                    name, token
                )));
            }
            if by_original.insert(original.clone(), i).is_some() {
                return Err(AnonError::ExportIntegrity(format!(
                    "key table `{}` maps {:?} twice",
                    name, original
                )));
            }
        }

        Ok(Self {
            name: name.to_string(),
            token_header: headers.0.to_string(),
            original_header: headers.1.to_string(),
            pairs,
            by_original,
            by_token,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn headers(&self) -> (&str, &str) {
        (&self.token_header, &self.original_header)
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Substitute `original` with its token. Absence is a coverage bug, not a data issue.
    pub fn token_for(&self, field: &str, original: &str) -> AnonResult<&str> {
        self.by_original
            .get(original)
            .map(|&i| self.pairs[i].0.as_str())
            .ok_or_else(|| AnonError::missing(field, original))
    }

    pub fn original_of(&self, token: &str) -> Option<&str> {
        self.by_token.get(token).map(|&i| self.pairs[i].1.as_str())
    }

    pub fn contains_token(&self, token: &str) -> bool {
        self.by_token.contains_key(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn colours() -> KeyTable {
        KeyTable::new(
            "keytable",
            ("Color", "Continent"),
            [
                ("Red", "APAC"),
                ("Blue", "Europe"),
                ("Green", "Africa"),
                ("Yellow", "The Americas"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_round_trip_every_token() {
        let table = colours();
        for (token, original) in table.pairs() {
            let substituted = table.token_for("continent_of_birth", original).unwrap();
            assert_eq!(substituted, token);
            assert_eq!(table.original_of(substituted), Some(original.as_str()));
        }
    }

    #[test]
    fn test_unknown_original_fails_loudly() {
        let err = colours().token_for("continent_of_birth", "Atlantis").unwrap_err();
        assert!(matches!(err, AnonError::MissingMapping { .. }));
    }

    #[test]
    fn test_duplicates_rejected() {
        let dup_token = KeyTable::new("t", ("a", "b"), [("1", "x"), ("1", "y")]);
        assert!(matches!(dup_token, Err(AnonError::ExportIntegrity(_))));

        let dup_original = KeyTable::new("t", ("a", "b"), [("1", "x"), ("2", "x")]);
        assert!(matches!(dup_original, Err(AnonError::ExportIntegrity(_))));
    }
}
