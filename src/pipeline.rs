// src/pipeline.rs
use anyhow::{bail, Result};
use chrono::{Local, NaiveDate};
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::AnonResult;
use crate::generalise::{
    postal::{resolve_regions, PostalSummary},
    ContinentResolver, Engine, Generaliser, PostalOptions, PostalOutcome, PostalReference,
    SENTINEL,
};
use crate::kanon::{self, Dataset, Exclusion, KReport, UnresolvedPolicy};
use crate::load::{RecordSource, Value};
use crate::policy::{Classification, OutputColumn, Policy};

/// Output of the generalisation stages.
#[derive(Clone, Debug)]
pub struct Anonymised {
    pub dataset: Dataset,
    pub classification: Classification,
    pub postal: PostalSummary,
    /// Band cells that fell back to the sentinel.
    pub out_of_range: usize,
}

/// Load → classify → type → resolve postcodes → generalise.
pub struct Pipeline {
    policy: Policy,
    engine: Engine,
    postal: Arc<dyn PostalReference>,
    postal_opts: PostalOptions,
}

impl Pipeline {
    pub fn new(
        policy: Policy,
        engine: Engine,
        postal: Arc<dyn PostalReference>,
        postal_opts: PostalOptions,
    ) -> Self {
        Self {
            policy,
            engine,
            postal,
            postal_opts,
        }
    }

    /// Survey policy with settings from `cfg`. Ages are computed against
    /// `cfg.reference_date`, or today when it is unset.
    pub fn from_config(cfg: &Config, postal: Arc<dyn PostalReference>) -> AnonResult<Self> {
        let reference = cfg
            .reference_date
            .unwrap_or_else(|| Local::now().date_naive());
        Ok(Self::new(
            Policy::survey()?,
            Engine::new(ContinentResolver::default(), reference, cfg.out_of_range),
            postal,
            cfg.postal.options(),
        ))
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn reference_date(&self) -> NaiveDate {
        self.engine.reference_date()
    }

    #[tracing::instrument(level = "info", skip_all, fields(reference = %self.reference_date()))]
    pub async fn anonymise(&self, source: &mut dyn RecordSource) -> Result<Anonymised> {
        let raw = source.load()?;
        let classification = self.policy.classify(&raw.headers)?;
        info!(
            columns = classification.columns.len(),
            dropped = classification.dropped.len(),
            "classified input fields"
        );
        let typed = raw.typed(|h| self.policy.type_of(h))?;

        let regions = match postal_column(&classification) {
            Some(col) => {
                let postcodes: Vec<Option<String>> = typed
                    .iter()
                    .map(|row| row[col.source].as_text().map(str::to_string))
                    .collect();
                Some(resolve_regions(self.postal.clone(), &postcodes, &self.postal_opts).await?)
            }
            None => None,
        };
        let outcomes = regions.as_ref().map(|r| r.outcomes.as_slice());
        let postal = regions.as_ref().map(|r| r.summary).unwrap_or_default();
        if postal.degraded() > 0 {
            warn!(
                degraded = postal.degraded(),
                "some postcodes could not be resolved; written as {}", SENTINEL
            );
        }

        // rayon keeps input order on collect
        let generalised = typed
            .par_iter()
            .enumerate()
            .map(|(i, row)| {
                let region = outcomes.and_then(|o| o.get(i)).map(PostalOutcome::region);
                self.generalise_row(&classification, row, region)
            })
            .collect::<AnonResult<Vec<_>>>()?;

        let out_of_range: usize = generalised.iter().map(|(_, n)| n).sum();
        let mut dataset = Dataset::new(classification.column_names());
        dataset.rows = generalised.into_iter().map(|(row, _)| row).collect();

        info!(rows = dataset.len(), out_of_range, "generalised dataset");
        Ok(Anonymised {
            dataset,
            classification,
            postal,
            out_of_range,
        })
    }

    fn generalise_row(
        &self,
        classification: &Classification,
        row: &[Value],
        region: Option<&str>,
    ) -> AnonResult<(Vec<String>, usize)> {
        let mut out = Vec::with_capacity(classification.columns.len());
        let mut out_of_range = 0;
        for col in &classification.columns {
            let value = &row[col.source];
            match &col.rule {
                None => out.push(value.to_string()),
                Some(rule) => {
                    let g = self.engine.apply(&col.field, rule, value, region)?;
                    out_of_range += usize::from(g.out_of_range);
                    out.push(g.value);
                }
            }
        }
        Ok((out, out_of_range))
    }
}

fn postal_column(classification: &Classification) -> Option<&OutputColumn> {
    classification.columns.iter().find(|c| {
        c.rule
            .as_ref()
            .is_some_and(|r| matches!(r.base, Generaliser::PostalRegion))
    })
}

/// Exclusions implied by `policy`: with `Exclude`, rows whose postal column
/// holds the sentinel's token are left out of the k calculation.
pub fn exclusions(
    classification: &Classification,
    policy: UnresolvedPolicy,
) -> AnonResult<Vec<Exclusion>> {
    if policy == UnresolvedPolicy::Category {
        return Ok(Vec::new());
    }
    let Some(col) = postal_column(classification) else {
        return Ok(Vec::new());
    };
    let value = match col.rule.as_ref().and_then(|r| r.key_table()) {
        Some(table) => table.token_for(&col.field, SENTINEL)?.to_string(),
        None => SENTINEL.to_string(),
    };
    Ok(vec![Exclusion {
        column: col.name.clone(),
        value,
    }])
}

/// k over the anonymised dataset for `quasi_identifiers`.
pub fn verify(
    anonymised: &Anonymised,
    quasi_identifiers: &[String],
    unresolved: UnresolvedPolicy,
) -> AnonResult<KReport> {
    let mut excl = exclusions(&anonymised.classification, unresolved)?;
    // only bites when the postal column is itself grouped on
    excl.retain(|e| quasi_identifiers.contains(&e.column));
    let report = kanon::verify(&anonymised.dataset, quasi_identifiers, &excl)?;
    if report.excluded > 0 {
        info!(excluded = report.excluded, "rows left out of k calculation");
    }
    Ok(report)
}

/// Caller-side gate before export.
pub fn check_threshold(report: &KReport, threshold: usize) -> Result<()> {
    if !report.satisfies(threshold) {
        bail!(
            "k = {} is below the required {} ({} group(s) too small)",
            report.k,
            threshold,
            report.below(threshold).len()
        );
    }
    Ok(())
}
