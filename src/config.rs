// src/config.rs
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{fs::File, path::Path, path::PathBuf, time::Duration};
use tracing::info;

use crate::export::ExportOptions;
use crate::generalise::{postal::LookupFailurePolicy, PostalOptions, PostcodesIo, RangePolicy};
use crate::kanon::UnresolvedPolicy;

/// Run settings, loaded from YAML. Every key is optional.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    /// "Today" for age calculation; the run's start date when unset.
    pub reference_date: Option<NaiveDate>,
    pub quasi_identifiers: Vec<String>,
    /// Minimum acceptable k, checked by the CLI before export.
    pub k_threshold: usize,
    pub out_of_range: RangePolicy,
    pub unresolved_postcodes: UnresolvedPolicy,
    pub postal: PostalConfig,
    pub export: ExportOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input: PathBuf::from("data/customer_information.csv"),
            output_dir: PathBuf::from("anonymised"),
            reference_date: None,
            quasi_identifiers: vec!["gender".into(), "banded_age".into()],
            k_threshold: 15,
            out_of_range: RangePolicy::default(),
            unresolved_postcodes: UnresolvedPolicy::default(),
            postal: PostalConfig::default(),
            export: ExportOptions::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening config {:?}", path))?;
        let cfg: Config =
            serde_yaml::from_reader(file).with_context(|| format!("parsing config {:?}", path))?;
        info!(config = %path.display(), "loaded config");
        Ok(cfg)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            info!(config = %path.display(), "no config file; using defaults");
            Ok(Self::default())
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostalConfig {
    pub base_url: String,
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub on_failure: LookupFailurePolicy,
}

impl Default for PostalConfig {
    fn default() -> Self {
        let opts = PostalOptions::default();
        Self {
            base_url: PostcodesIo::DEFAULT_BASE_URL.into(),
            concurrency: opts.concurrency,
            timeout_secs: opts.timeout.as_secs(),
            max_retries: opts.max_retries,
            retry_delay_ms: opts.retry_delay.as_millis() as u64,
            on_failure: opts.on_failure,
        }
    }
}

impl PostalConfig {
    pub fn options(&self) -> PostalOptions {
        PostalOptions {
            concurrency: self.concurrency.max(1),
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries.max(1),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            on_failure: self.on_failure,
        }
    }
}
