// src/generalise/mod.rs
pub mod bands;
pub mod collapse;
pub mod geo;
pub mod postal;
pub mod tokens;

pub use bands::{age_in_years, Bins, LabelledBins, RangePolicy};
pub use collapse::CollapseTable;
pub use geo::{Continent, ContinentResolver, GeoReference, StaticGeoReference};
pub use postal::{PostalOptions, PostalOutcome, PostalReference, PostcodesIo};
pub use tokens::KeyTable;

use chrono::NaiveDate;

use crate::error::{AnonError, AnonResult};
use crate::load::Value;

/// Written wherever a value cannot be generalised (unknown region, out-of-range band).
pub const SENTINEL: &str = "NA";

/// First step of a rule: typed input value → category string.
#[derive(Clone, Debug)]
pub enum Generaliser {
    /// Numeric value → `(a, b]`.
    Interval(Bins),
    /// Numeric value → tier label.
    Labelled(LabelledBins),
    /// Date of birth → age → `(a, b]`.
    AgeBand(Bins),
    /// Country name → continent name.
    Continent,
    /// Region already resolved for the row by the postal stage.
    PostalRegion,
    /// Raw text category, refined by later steps.
    Category,
}

/// Follow-up steps applied to the category string, in order.
#[derive(Clone, Debug)]
pub enum Refinement {
    Collapse(CollapseTable),
    Tokenise(KeyTable),
}

/// How one input field becomes one output column.
#[derive(Clone, Debug)]
pub struct FieldRule {
    pub output: String,
    pub base: Generaliser,
    pub refine: Vec<Refinement>,
}

impl FieldRule {
    pub fn new(output: &str, base: Generaliser) -> Self {
        Self {
            output: output.to_string(),
            base,
            refine: Vec::new(),
        }
    }

    pub fn collapse(mut self, table: CollapseTable) -> Self {
        self.refine.push(Refinement::Collapse(table));
        self
    }

    pub fn tokenise(mut self, table: KeyTable) -> Self {
        self.refine.push(Refinement::Tokenise(table));
        self
    }

    /// Key table whose tokens end up in the output column, if any.
    pub fn key_table(&self) -> Option<&KeyTable> {
        match self.refine.last() {
            Some(Refinement::Tokenise(t)) => Some(t),
            _ => None,
        }
    }
}

/// One generalised cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Generalised {
    pub value: String,
    /// The band step fell back to the sentinel.
    pub out_of_range: bool,
}

/// Applies field rules to single values.
#[derive(Clone, Debug)]
pub struct Engine {
    continents: ContinentResolver,
    reference: NaiveDate,
    range: RangePolicy,
}

impl Engine {
    pub fn new(continents: ContinentResolver, reference: NaiveDate, range: RangePolicy) -> Self {
        Self {
            continents,
            reference,
            range,
        }
    }

    pub fn reference_date(&self) -> NaiveDate {
        self.reference
    }

    /// Generalise `value` of input `field`. `postal_region` is the row's
    /// pre-resolved region and is only read by `Generaliser::PostalRegion`.
    pub fn apply(
        &self,
        field: &str,
        rule: &FieldRule,
        value: &Value,
        postal_region: Option<&str>,
    ) -> AnonResult<Generalised> {
        let mut out_of_range = false;
        let mut banded = |band: Option<String>| -> AnonResult<String> {
            match (band, self.range) {
                (Some(b), _) => Ok(b),
                (None, RangePolicy::Sentinel) => {
                    out_of_range = true;
                    Ok(SENTINEL.to_string())
                }
                (None, RangePolicy::Reject) => Err(AnonError::Range {
                    field: field.to_string(),
                    value: describe(value),
                }),
            }
        };

        let mut current = match &rule.base {
            Generaliser::Interval(bins) => banded(value.as_number().and_then(|v| bins.band(v)))?,
            Generaliser::Labelled(bins) => banded(
                value
                    .as_number()
                    .and_then(|v| bins.band(v))
                    .map(str::to_string),
            )?,
            Generaliser::AgeBand(bins) => banded(match value {
                Value::Date(born) => bins.band(f64::from(age_in_years(*born, self.reference))),
                _ => None,
            })?,
            Generaliser::Continent => match value {
                Value::Text(country) => self.continents.resolve(field, country)?.to_string(),
                other => return Err(AnonError::missing(field, describe(other))),
            },
            Generaliser::PostalRegion => postal_region.unwrap_or(SENTINEL).to_string(),
            Generaliser::Category => value.to_string(),
        };

        for step in &rule.refine {
            current = match step {
                Refinement::Collapse(table) => table.collapse(field, &current)?.to_string(),
                Refinement::Tokenise(table) => table.token_for(field, &current)?.to_string(),
            };
        }

        Ok(Generalised {
            value: current,
            out_of_range,
        })
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Missing => "<missing>".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(range: RangePolicy) -> Engine {
        Engine::new(
            ContinentResolver::default(),
            NaiveDate::from_ymd_opt(2021, 6, 1).unwrap(),
            range,
        )
    }

    fn weight_rule() -> FieldRule {
        FieldRule::new(
            "banded_weight",
            Generaliser::Interval(Bins::new(vec![30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0]).unwrap()),
        )
    }

    #[test]
    fn test_interval_rule() {
        let out = engine(RangePolicy::Reject)
            .apply("weight", &weight_rule(), &Value::Number(55.0), None)
            .unwrap();
        assert_eq!(out.value, "(50, 60]");
        assert!(!out.out_of_range);
    }

    #[test]
    fn test_out_of_range_policies() {
        let sentinel = engine(RangePolicy::Sentinel)
            .apply("weight", &weight_rule(), &Value::Number(120.0), None)
            .unwrap();
        assert_eq!(sentinel.value, SENTINEL);
        assert!(sentinel.out_of_range);

        let missing = engine(RangePolicy::Sentinel)
            .apply("weight", &weight_rule(), &Value::Missing, None)
            .unwrap();
        assert!(missing.out_of_range);

        let err = engine(RangePolicy::Reject)
            .apply("weight", &weight_rule(), &Value::Number(30.0), None)
            .unwrap_err();
        assert!(matches!(err, AnonError::Range { ref field, .. } if field == "weight"));
    }

    #[test]
    fn test_age_band_uses_reference_year() {
        let rule = FieldRule::new(
            "banded_age",
            Generaliser::AgeBand(Bins::new(vec![0.0, 20.0, 40.0, 60.0, 80.0]).unwrap()),
        );
        let born = Value::Date(NaiveDate::from_ymd_opt(1981, 12, 31).unwrap());
        // 2021 - 1981 = 40, right-closed
        let out = engine(RangePolicy::Reject)
            .apply("birthdate", &rule, &born, None)
            .unwrap();
        assert_eq!(out.value, "(20, 40]");
    }

    #[test]
    fn test_chain_collapse_then_tokenise() {
        let rule = FieldRule::new("education_level", Generaliser::Category)
            .collapse(CollapseTable::new([("phD", "postgraduate"), ("masters", "postgraduate")]))
            .tokenise(KeyTable::new("edu", ("Color", "Education Level"), [("Brown", "postgraduate")]).unwrap());
        let out = engine(RangePolicy::Reject)
            .apply("education_level", &rule, &Value::Text("phD".into()), None)
            .unwrap();
        assert_eq!(out.value, "Brown");
        assert_eq!(rule.key_table().map(KeyTable::name), Some("edu"));
    }

    #[test]
    fn test_postal_region_defaults_to_sentinel() {
        let rule = FieldRule::new("postcode_region", Generaliser::PostalRegion);
        let e = engine(RangePolicy::Reject);
        let value = Value::Text("M1 1AE".into());
        assert_eq!(e.apply("postcode", &rule, &value, Some("London")).unwrap().value, "London");
        assert_eq!(e.apply("postcode", &rule, &value, None).unwrap().value, SENTINEL);
    }

    #[test]
    fn test_continent_rule() {
        let rule = FieldRule::new("continent_of_birth", Generaliser::Continent);
        let out = engine(RangePolicy::Reject)
            .apply("country_of_birth", &rule, &Value::Text("Korea".into()), None)
            .unwrap();
        assert_eq!(out.value, "Asia");
    }
}
