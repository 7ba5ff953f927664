// src/policy/mod.rs
use std::collections::HashSet;

use crate::error::{AnonError, AnonResult};
use crate::generalise::{
    Bins, CollapseTable, FieldRule, Generaliser, KeyTable, LabelledBins, SENTINEL,
};
use crate::load::FieldType;

/// Why a field never reaches the output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Unique personal identifier.
    Identifier,
    /// Same value for every respondent given the collection scope.
    Constant,
}

#[derive(Clone, Debug)]
pub enum Action {
    Drop(DropReason),
    KeepRaw,
    Generalise(FieldRule),
}

#[derive(Clone, Debug)]
pub struct FieldPolicy {
    pub field: String,
    pub ty: FieldType,
    pub action: Action,
}

impl FieldPolicy {
    fn new(field: &str, ty: FieldType, action: Action) -> Self {
        Self {
            field: field.to_string(),
            ty,
            action,
        }
    }

    /// Column name in the anonymised dataset, `None` for dropped fields.
    pub fn output_name(&self) -> Option<&str> {
        match &self.action {
            Action::Drop(_) => None,
            Action::KeepRaw => Some(&self.field),
            Action::Generalise(rule) => Some(&rule.output),
        }
    }
}

/// One column of the anonymised dataset and where it comes from.
#[derive(Clone, Debug)]
pub struct OutputColumn {
    pub name: String,
    /// Source field name.
    pub field: String,
    /// Position of the source field in the input header.
    pub source: usize,
    /// `None` for KEEP_RAW.
    pub rule: Option<FieldRule>,
}

/// Result of checking the input header against the policy.
#[derive(Clone, Debug)]
pub struct Classification {
    pub columns: Vec<OutputColumn>,
    pub dropped: Vec<(String, DropReason)>,
}

impl Classification {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// `(output column, key table)` for every tokenised column.
    pub fn key_tables(&self) -> Vec<(&str, &KeyTable)> {
        self.columns
            .iter()
            .filter_map(|c| {
                c.rule
                    .as_ref()
                    .and_then(FieldRule::key_table)
                    .map(|t| (c.name.as_str(), t))
            })
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<&OutputColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Static field policy. Non-dropped entries are listed in output column order.
#[derive(Clone, Debug)]
pub struct Policy {
    fields: Vec<FieldPolicy>,
}

impl Policy {
    pub fn new(fields: Vec<FieldPolicy>) -> AnonResult<Self> {
        let mut names = HashSet::new();
        let mut outputs = HashSet::new();
        for p in &fields {
            if !names.insert(p.field.as_str()) {
                return Err(AnonError::Schema(format!(
                    "field `{}` has more than one policy",
                    p.field
                )));
            }
            if let Some(out) = p.output_name() {
                if !outputs.insert(out) {
                    return Err(AnonError::Schema(format!(
                        "output column `{}` produced twice",
                        out
                    )));
                }
            }
        }
        Ok(Self { fields })
    }

    /// The policy for the survey respondent export.
    pub fn survey() -> AnonResult<Self> {
        use Action::*;
        use DropReason::*;
        use FieldType::*;

        let fields = vec![
            FieldPolicy::new("given_name", Text, Drop(Identifier)),
            FieldPolicy::new("surname", Text, Drop(Identifier)),
            FieldPolicy::new("phone_number", Text, Drop(Identifier)),
            FieldPolicy::new("national_insurance_number", Text, Drop(Identifier)),
            FieldPolicy::new("bank_account_number", Text, Drop(Identifier)),
            FieldPolicy::new("current_country", Text, Drop(Constant)),
            FieldPolicy::new("gender", Text, KeepRaw),
            FieldPolicy::new(
                "birthdate",
                Date,
                Generalise(FieldRule::new(
                    "banded_age",
                    Generaliser::AgeBand(Bins::new(vec![0.0, 20.0, 40.0, 60.0, 80.0])?),
                )),
            ),
            FieldPolicy::new(
                "country_of_birth",
                Text,
                Generalise(
                    FieldRule::new("continent_of_birth", Generaliser::Continent)
                        .collapse(continent_regions())
                        .tokenise(continent_key_table()?),
                ),
            ),
            FieldPolicy::new(
                "postcode",
                Text,
                Generalise(
                    FieldRule::new("postcode_region", Generaliser::PostalRegion)
                        .collapse(uk_regions())
                        .tokenise(region_key_table()?),
                ),
            ),
            FieldPolicy::new("cc_status", Text, KeepRaw),
            FieldPolicy::new(
                "weight",
                Number,
                Generalise(FieldRule::new(
                    "banded_weight",
                    Generaliser::Interval(Bins::new(vec![
                        30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0,
                    ])?),
                )),
            ),
            FieldPolicy::new(
                "height",
                Number,
                Generalise(FieldRule::new(
                    "banded_height",
                    Generaliser::Interval(Bins::new(vec![1.4, 1.5, 1.6, 1.7, 1.8, 1.9, 2.0])?),
                )),
            ),
            FieldPolicy::new("blood_group", Text, KeepRaw),
            FieldPolicy::new(
                "avg_n_drinks_per_week",
                Number,
                Generalise(FieldRule::new(
                    "banded_weekly_avg_drinks",
                    Generaliser::Labelled(LabelledBins::new(
                        vec![0.0, 6.0, 12.0, 100.0],
                        ["low", "medium", "high"],
                    )?),
                )),
            ),
            FieldPolicy::new(
                "avg_n_cigret_per_week",
                Number,
                Generalise(FieldRule::new(
                    "banded_weekly_avg_cigret",
                    Generaliser::Labelled(LabelledBins::new(
                        vec![0.0, 40.0, 175.0, 500.0],
                        ["light", "medium", "heavy"],
                    )?),
                )),
            ),
            FieldPolicy::new(
                "education_level",
                Text,
                Generalise(
                    FieldRule::new("education_level", Generaliser::Category)
                        .collapse(education_levels())
                        .tokenise(education_key_table()?),
                ),
            ),
            FieldPolicy::new(
                "n_countries_visited",
                Number,
                Generalise(FieldRule::new(
                    "n_countries_visited_grouped",
                    Generaliser::Interval(Bins::new(
                        (0..=11).map(|i| f64::from(i * 5)).collect::<Vec<_>>(),
                    )?),
                )),
            ),
        ];
        Self::new(fields)
    }

    pub fn fields(&self) -> &[FieldPolicy] {
        &self.fields
    }

    pub fn type_of(&self, field: &str) -> Option<FieldType> {
        self.fields.iter().find(|p| p.field == field).map(|p| p.ty)
    }

    /// Match the input header against the policy. Every header needs exactly
    /// one policy and every policy needs its header.
    pub fn classify(&self, headers: &[String]) -> AnonResult<Classification> {
        let mut seen = HashSet::new();
        for h in headers {
            if !seen.insert(h.as_str()) {
                return Err(AnonError::Schema(format!("duplicate input field `{}`", h)));
            }
        }

        let unclassified: Vec<&str> = headers
            .iter()
            .map(String::as_str)
            .filter(|h| self.type_of(h).is_none())
            .collect();
        if !unclassified.is_empty() {
            return Err(AnonError::Schema(format!(
                "no policy for input field(s): {}",
                unclassified.join(", ")
            )));
        }

        let absent: Vec<&str> = self
            .fields
            .iter()
            .map(|p| p.field.as_str())
            .filter(|f| !seen.contains(f))
            .collect();
        if !absent.is_empty() {
            return Err(AnonError::Schema(format!(
                "input is missing expected field(s): {}",
                absent.join(", ")
            )));
        }

        let mut columns = Vec::new();
        let mut dropped = Vec::new();
        for p in &self.fields {
            let source = headers
                .iter()
                .position(|h| *h == p.field)
                .ok_or_else(|| AnonError::Schema(format!("missing field `{}`", p.field)))?;
            match &p.action {
                Action::Drop(reason) => dropped.push((p.field.clone(), *reason)),
                Action::KeepRaw => columns.push(OutputColumn {
                    name: p.field.clone(),
                    field: p.field.clone(),
                    source,
                    rule: None,
                }),
                Action::Generalise(rule) => columns.push(OutputColumn {
                    name: rule.output.clone(),
                    field: p.field.clone(),
                    source,
                    rule: Some(rule.clone()),
                }),
            }
        }

        Ok(Classification { columns, dropped })
    }
}

fn continent_regions() -> CollapseTable {
    CollapseTable::new([
        ("Asia", "APAC"),
        ("Oceania", "APAC"),
        ("Antarctica", "APAC"),
        ("North America", "The Americas"),
        ("South America", "The Americas"),
        ("Europe", "Europe"),
        ("Africa", "Africa"),
    ])
}

fn uk_regions() -> CollapseTable {
    CollapseTable::new([
        ("North West", "North"),
        ("North East", "North"),
        ("Yorkshire and The Humber", "North"),
        ("South East", "South"),
        ("South West", "South"),
        ("East Midlands", "Midlands"),
        ("West Midlands", "Midlands"),
        ("London", "London"),
        ("East of England", "East of England"),
        (SENTINEL, SENTINEL),
    ])
}

fn education_levels() -> CollapseTable {
    CollapseTable::new([
        ("primary", "compulsory"),
        ("secondary", "compulsory"),
        ("bachelor", "undergraduate"),
        ("masters", "postgraduate"),
        ("phD", "postgraduate"),
        ("other", "other"),
    ])
}

fn continent_key_table() -> AnonResult<KeyTable> {
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
}

fn region_key_table() -> AnonResult<KeyTable> {
    KeyTable::new(
        "postkeytable",
        ("ID", "UK Region"),
        [
            ("0", SENTINEL),
            ("1", "North"),
            ("2", "London"),
            ("3", "Midlands"),
            ("4", "South"),
            ("5", "East of England"),
        ],
    )
}

fn education_key_table() -> AnonResult<KeyTable> {
    KeyTable::new(
        "edukeytable",
        ("Color", "Education Level"),
        [
            ("Grey", "compulsory"),
            ("White", "undergraduate"),
            ("Brown", "postgraduate"),
            ("Black", "other"),
        ],
    )
}

/// Header of the survey export, in its original column order.
pub const SURVEY_HEADER: [&str; 18] = [
    "given_name",
    "surname",
    "gender",
    "birthdate",
    "country_of_birth",
    "current_country",
    "phone_number",
    "postcode",
    "national_insurance_number",
    "bank_account_number",
    "cc_status",
    "weight",
    "height",
    "blood_group",
    "avg_n_drinks_per_week",
    "avg_n_cigret_per_week",
    "education_level",
    "n_countries_visited",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Vec<String> {
        SURVEY_HEADER.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_survey_policy_is_total() {
        let policy = Policy::survey().unwrap();
        let c = policy.classify(&header()).unwrap();

        assert_eq!(c.columns.len() + c.dropped.len(), SURVEY_HEADER.len());
        assert_eq!(
            c.column_names(),
            vec![
                "gender",
                "banded_age",
                "continent_of_birth",
                "postcode_region",
                "cc_status",
                "banded_weight",
                "banded_height",
                "blood_group",
                "banded_weekly_avg_drinks",
                "banded_weekly_avg_cigret",
                "education_level",
                "n_countries_visited_grouped",
            ]
        );
        for (field, _) in &c.dropped {
            assert!(c.columns.iter().all(|col| &col.field != field));
        }
    }

    #[test]
    fn test_columns_independent_of_header_order() {
        let policy = Policy::survey().unwrap();
        let mut shuffled = header();
        shuffled.reverse();
        let a = policy.classify(&header()).unwrap();
        let b = policy.classify(&shuffled).unwrap();
        assert_eq!(a.column_names(), b.column_names());
        assert_eq!(b.find("gender").unwrap().source, SURVEY_HEADER.len() - 3);
    }

    #[test]
    fn test_missing_and_extra_fields() {
        let policy = Policy::survey().unwrap();

        let mut missing = header();
        missing.retain(|h| h != "postcode");
        let err = policy.classify(&missing).unwrap_err();
        assert!(err.to_string().contains("postcode"));

        let mut extra = header();
        extra.push("email".into());
        let err = policy.classify(&extra).unwrap_err();
        assert!(matches!(err, AnonError::Schema(ref m) if m.contains("email")));

        let mut dup = header();
        dup.push("gender".into());
        assert!(policy.classify(&dup).is_err());
    }

    #[test]
    fn test_overlapping_policy_rejected() {
        let fields = vec![
            FieldPolicy::new("gender", FieldType::Text, Action::KeepRaw),
            FieldPolicy::new("gender", FieldType::Text, Action::Drop(DropReason::Identifier)),
        ];
        assert!(matches!(Policy::new(fields), Err(AnonError::Schema(_))));
    }

    #[test]
    fn test_three_key_tables() {
        let policy = Policy::survey().unwrap();
        let c = policy.classify(&header()).unwrap();
        let names: Vec<(&str, &str)> = c
            .key_tables()
            .into_iter()
            .map(|(col, t)| (col, t.name()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("continent_of_birth", "keytable"),
                ("postcode_region", "postkeytable"),
                ("education_level", "edukeytable"),
            ]
        );
    }

    #[test]
    fn test_collapse_targets_are_covered_by_key_tables() {
        // every collapsed category must have a token
        for (table, keys) in [
            (continent_regions(), continent_key_table().unwrap()),
            (uk_regions(), region_key_table().unwrap()),
            (education_levels(), education_key_table().unwrap()),
        ] {
            for category in table.categories() {
                assert!(keys.token_for("test", category).is_ok(), "{}", category);
            }
        }
    }
}
