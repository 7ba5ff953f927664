// src/generalise/geo.rs
use once_cell::sync::Lazy;
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::warn;

use crate::error::{AnonError, AnonResult};

/// Continent names as they appear in the generalised data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Continent {
    Africa,
    Antarctica,
    Asia,
    Europe,
    NorthAmerica,
    Oceania,
    SouthAmerica,
}

impl Continent {
    pub const ALL: [Continent; 7] = [
        Continent::Africa,
        Continent::Antarctica,
        Continent::Asia,
        Continent::Europe,
        Continent::NorthAmerica,
        Continent::Oceania,
        Continent::SouthAmerica,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Continent::Africa => "Africa",
            Continent::Antarctica => "Antarctica",
            Continent::Asia => "Asia",
            Continent::Europe => "Europe",
            Continent::NorthAmerica => "North America",
            Continent::Oceania => "Oceania",
            Continent::SouthAmerica => "South America",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s.trim())
    }

    /// Two-letter continent code (`AF`, `AN`, `AS`, `EU`, `NA`, `OC`, `SA`).
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "AF" => Some(Continent::Africa),
            "AN" => Some(Continent::Antarctica),
            "AS" => Some(Continent::Asia),
            "EU" => Some(Continent::Europe),
            "NA" => Some(Continent::NorthAmerica),
            "OC" => Some(Continent::Oceania),
            "SA" => Some(Continent::SouthAmerica),
            _ => None,
        }
    }
}

impl fmt::Display for Continent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Country name → continent reference.
pub trait GeoReference: Send + Sync {
    fn resolve_continent(&self, country: &str) -> Option<Continent>;
}

static COUNTRY_TABLE: &str = include_str!("../../data/country_continent.csv");

static COUNTRIES: Lazy<HashMap<String, Continent>> = Lazy::new(|| {
    let mut map = HashMap::new();
    let mut rdr = csv::Reader::from_reader(COUNTRY_TABLE.as_bytes());
    for record in rdr.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!("skipping bad country table row: {}", e);
                continue;
            }
        };
        match (record.get(0), record.get(1).and_then(Continent::from_code)) {
            (Some(name), Some(continent)) => {
                map.insert(name.trim().to_lowercase(), continent);
            }
            _ => warn!(row = ?record, "skipping incomplete country table row"),
        }
    }
    map
});

/// Embedded country table shipped with the crate. Matching is case-insensitive.
#[derive(Clone, Copy, Debug, Default)]
pub struct StaticGeoReference;

impl GeoReference for StaticGeoReference {
    fn resolve_continent(&self, country: &str) -> Option<Continent> {
        COUNTRIES.get(&country.trim().to_lowercase()).copied()
    }
}

/// Names the reference table does not know: historical, disputed or
/// decorated territory names. Checked before the reference.
static OVERRIDES: &[(&str, Continent)] = &[
    ("Korea", Continent::Asia),
    ("Palestinian Territory", Continent::Asia),
    ("Saint Barthelemy", Continent::NorthAmerica),
    ("Saint Helena", Continent::Africa),
    ("Reunion", Continent::Africa),
    ("United States Minor Outlying Islands", Continent::NorthAmerica),
    ("Antarctica (the territory South of 60 deg S)", Continent::Antarctica),
    ("Western Sahara", Continent::Africa),
    ("Svalbard & Jan Mayen Islands", Continent::Europe),
    ("Libyan Arab Jamahiriya", Continent::Africa),
    ("Pitcairn Islands", Continent::Oceania),
    ("Slovakia (Slovak Republic)", Continent::Europe),
    ("Bouvet Island (Bouvetoya)", Continent::Antarctica),
    ("Holy See (Vatican City State)", Continent::Europe),
    ("Timor-Leste", Continent::Asia),
    ("British Indian Ocean Territory (Chagos Archipelago)", Continent::Asia),
    ("Cote d'Ivoire", Continent::Africa),
    ("Netherlands Antilles", Continent::NorthAmerica),
];

/// Override table first, then continent names passed through, then the reference.
#[derive(Clone)]
pub struct ContinentResolver {
    reference: Arc<dyn GeoReference>,
}

impl ContinentResolver {
    pub fn new(reference: Arc<dyn GeoReference>) -> Self {
        Self { reference }
    }

    pub fn resolve(&self, field: &str, country: &str) -> AnonResult<Continent> {
        let name = country.trim();
        if let Some((_, c)) = OVERRIDES.iter().find(|(n, _)| *n == name) {
            return Ok(*c);
        }
        if let Some(c) = Continent::from_name(name) {
            return Ok(c);
        }
        self.reference
            .resolve_continent(name)
            .ok_or_else(|| AnonError::missing(field, name))
    }
}

impl Default for ContinentResolver {
    fn default() -> Self {
        Self::new(Arc::new(StaticGeoReference))
    }
}

impl fmt::Debug for ContinentResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinentResolver").finish_non_exhaustive()
    }
}
