// src/generalise/postal.rs
use async_trait::async_trait;
use futures::{stream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use url::Url;

use super::SENTINEL;
use crate::error::{AnonError, AnonResult};

/// Remote postcode reference. Both calls may fail independently.
#[async_trait]
pub trait PostalReference: Send + Sync {
    /// Best matching full postcode for a prefix, if any.
    async fn autocomplete_prefix(&self, prefix: &str) -> AnonResult<Option<String>>;
    /// Administrative region of a full postcode, if known.
    async fn region_of(&self, code: &str) -> AnonResult<Option<String>>;
}

/// What happened to one row's postcode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PostalOutcome {
    Resolved(String),
    UnknownPrefix,
    NoRegion,
    ServiceFailed(String),
}

impl PostalOutcome {
    /// Region to write into the row; every non-resolved outcome yields the sentinel.
    pub fn region(&self) -> &str {
        match self {
            PostalOutcome::Resolved(r) => r,
            _ => SENTINEL,
        }
    }
}

/// Behaviour when the service still fails after retries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupFailurePolicy {
    #[default]
    Sentinel,
    Abort,
}

#[derive(Clone, Debug)]
pub struct PostalOptions {
    pub concurrency: usize,
    pub timeout: Duration,
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub on_failure: LookupFailurePolicy,
}

impl Default for PostalOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            on_failure: LookupFailurePolicy::Sentinel,
        }
    }
}

/// Per-outcome row counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PostalSummary {
    pub resolved: usize,
    pub unknown_prefix: usize,
    pub no_region: usize,
    pub service_failed: usize,
}

impl PostalSummary {
    pub fn degraded(&self) -> usize {
        self.unknown_prefix + self.no_region + self.service_failed
    }

    fn count(&mut self, outcome: &PostalOutcome) {
        match outcome {
            PostalOutcome::Resolved(_) => self.resolved += 1,
            PostalOutcome::UnknownPrefix => self.unknown_prefix += 1,
            PostalOutcome::NoRegion => self.no_region += 1,
            PostalOutcome::ServiceFailed(_) => self.service_failed += 1,
        }
    }
}

/// One outcome per input row, in input order.
#[derive(Clone, Debug, Default)]
pub struct PostalResolution {
    pub outcomes: Vec<PostalOutcome>,
    pub summary: PostalSummary,
}

static OUTCODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{1,2}[0-9][A-Z0-9]?$").expect("outcode regex should parse"));

/// Full postcode written without its space: outcode then a `9AA` inward code.
static UNSPACED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Z]{1,2}[0-9][A-Z0-9]?)[0-9][A-Z]{2}$").expect("postcode regex should parse")
});

/// Leading portion of a postcode, upper-cased. `None` if it is not outcode-shaped.
pub fn outcode(postcode: &str) -> Option<String> {
    let head = postcode.split_whitespace().next()?.to_ascii_uppercase();
    if OUTCODE.is_match(&head) {
        return Some(head);
    }
    UNSPACED
        .captures(&head)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Each attempt gets its own `opts.timeout`; a timed-out attempt is retried
/// like any other lookup failure.
async fn with_retries<T, F, Fut>(query: &str, opts: &PostalOptions, mut call: F) -> AnonResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AnonResult<T>>,
{
    let max_retries = opts.max_retries.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match timeout(opts.timeout, call()).await {
            Ok(r) => r,
            Err(_) => Err(AnonError::lookup(
                query,
                format!("timed out after {:?}", opts.timeout),
            )),
        };
        match result {
            Err(e @ AnonError::ExternalLookup { .. }) if attempt < max_retries => {
                debug!(attempt, error = %e, "retrying postal lookup");
                sleep(opts.retry_delay).await;
            }
            other => return other,
        }
    }
}

async fn resolve_outcode(
    service: &dyn PostalReference,
    outcode: &str,
    opts: &PostalOptions,
) -> AnonResult<PostalOutcome> {
    let full = with_retries(outcode, opts, || service.autocomplete_prefix(outcode)).await?;
    let Some(code) = full else {
        return Ok(PostalOutcome::UnknownPrefix);
    };
    let region = with_retries(&code, opts, || service.region_of(&code)).await?;
    Ok(match region {
        Some(r) => PostalOutcome::Resolved(r),
        None => PostalOutcome::NoRegion,
    })
}

async fn lookup_outcode(
    service: &dyn PostalReference,
    outcode: &str,
    opts: &PostalOptions,
) -> PostalOutcome {
    match resolve_outcode(service, outcode, opts).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(outcode, error = %e, "postal lookup failed");
            PostalOutcome::ServiceFailed(e.to_string())
        }
    }
}

/// Resolve every row's postcode to a region or the sentinel.
///
/// Distinct outcodes are looked up once each with at most `opts.concurrency`
/// requests in flight; results are reassembled in row order.
#[tracing::instrument(level = "info", skip_all, fields(rows = postcodes.len()))]
pub async fn resolve_regions(
    service: Arc<dyn PostalReference>,
    postcodes: &[Option<String>],
    opts: &PostalOptions,
) -> AnonResult<PostalResolution> {
    let row_outcodes: Vec<Option<String>> = postcodes
        .iter()
        .map(|p| p.as_deref().and_then(outcode))
        .collect();

    let mut unique: Vec<&str> = Vec::new();
    let mut slot: HashMap<&str, usize> = HashMap::new();
    for oc in row_outcodes.iter().flatten() {
        slot.entry(oc.as_str()).or_insert_with(|| {
            unique.push(oc.as_str());
            unique.len() - 1
        });
    }
    info!(distinct = unique.len(), "looking up outcodes");

    let service = service.as_ref();
    let resolved: Vec<PostalOutcome> = stream::iter(unique.iter().copied())
        .map(|oc| lookup_outcode(service, oc, opts))
        .buffered(opts.concurrency.max(1))
        .collect()
        .await;

    let mut summary = PostalSummary::default();
    let outcomes: Vec<PostalOutcome> = row_outcodes
        .iter()
        .map(|oc| match oc {
            Some(oc) => resolved[slot[oc.as_str()]].clone(),
            None => PostalOutcome::UnknownPrefix,
        })
        .inspect(|o| summary.count(o))
        .collect();

    if opts.on_failure == LookupFailurePolicy::Abort {
        if let Some((i, PostalOutcome::ServiceFailed(reason))) = outcomes
            .iter()
            .enumerate()
            .find(|(_, o)| matches!(o, PostalOutcome::ServiceFailed(_)))
        {
            return Err(AnonError::lookup(
                postcodes[i].as_deref().unwrap_or_default(),
                reason,
            ));
        }
    }

    info!(
        resolved = summary.resolved,
        unknown_prefix = summary.unknown_prefix,
        no_region = summary.no_region,
        service_failed = summary.service_failed,
        "postal lookups done"
    );
    Ok(PostalResolution { outcomes, summary })
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: Option<T>,
}

#[derive(Deserialize)]
struct PostcodeRecord {
    region: Option<String>,
}

/// HTTP client for the postcodes.io API.
#[derive(Clone, Debug)]
pub struct PostcodesIo {
    client: Client,
    base: Url,
}

impl PostcodesIo {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.postcodes.io";

    pub fn new(client: Client, base_url: &str) -> anyhow::Result<Self> {
        let base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            anyhow::bail!("postal base URL cannot carry a path: {}", base_url);
        }
        Ok(Self { client, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get_result<T: DeserializeOwned>(
        &self,
        query: &str,
        url: Url,
    ) -> AnonResult<Option<T>> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AnonError::lookup(query, e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp
            .error_for_status()
            .map_err(|e| AnonError::lookup(query, e))?;
        let body: Envelope<T> = resp.json().await.map_err(|e| AnonError::lookup(query, e))?;
        Ok(body.result)
    }
}

#[async_trait]
impl PostalReference for PostcodesIo {
    async fn autocomplete_prefix(&self, prefix: &str) -> AnonResult<Option<String>> {
        let url = self.endpoint(&["postcodes", prefix, "autocomplete"]);
        let matches: Option<Vec<String>> = self.get_result(prefix, url).await?;
        Ok(matches.and_then(|m| m.into_iter().next()))
    }

    async fn region_of(&self, code: &str) -> AnonResult<Option<String>> {
        let url = self.endpoint(&["postcodes", code]);
        let record: Option<PostcodeRecord> = self.get_result(code, url).await?;
        Ok(record.and_then(|r| r.region))
    }
}
