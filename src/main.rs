use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use reqwest::Client;
use serde::Serialize;
use std::{fs::File, path::PathBuf, sync::Arc, time::Duration};
use surveyanon::{
    config::Config,
    export,
    generalise::{postal::PostalSummary, PostcodesIo},
    load::CsvFile,
    pipeline::{self, Pipeline},
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Anonymise a survey export and check its k-anonymity"
)]
struct Args {
    /// YAML settings; defaults apply when the file is absent.
    #[arg(short, long, env = "SURVEYANON_CONFIG", default_value = "surveyanon.yaml")]
    config: PathBuf,
    #[arg(short, long)]
    input: Option<PathBuf>,
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Date ages are computed against (YYYY-MM-DD).
    #[arg(long)]
    reference_date: Option<NaiveDate>,
    /// Minimum acceptable k.
    #[arg(short = 'k', long)]
    threshold: Option<usize>,
    /// Export even when k is below the threshold.
    #[arg(long)]
    force: bool,
    /// Replace an existing output directory.
    #[arg(long)]
    overwrite: bool,
    /// Write the dataset as plain CSV instead of an encrypted archive.
    #[arg(long)]
    no_encrypt: bool,
    /// Also write a JSON run summary to this path.
    #[arg(long)]
    summary: Option<PathBuf>,
}

#[derive(Serialize)]
struct RunSummary {
    input: PathBuf,
    output: PathBuf,
    reference_date: NaiveDate,
    rows: usize,
    quasi_identifiers: Vec<String>,
    k: Option<usize>,
    threshold: usize,
    groups_below_threshold: usize,
    excluded_rows: usize,
    out_of_range_cells: usize,
    postal: PostalSummary,
    files: Vec<PathBuf>,
    credential: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();

    std::panic::set_hook(Box::new(|info| {
        eprintln!("panic: {:?}", info);
    }));

    // ─── 2) settings: file, then flags ───────────────────────────────
    let args = Args::parse();
    let mut cfg = Config::load_or_default(&args.config)?;
    if let Some(input) = args.input {
        cfg.input = input;
    }
    if let Some(output) = args.output {
        cfg.output_dir = output;
    }
    if args.reference_date.is_some() {
        cfg.reference_date = args.reference_date;
    }
    if let Some(k) = args.threshold {
        cfg.k_threshold = k;
    }
    cfg.export.overwrite |= args.overwrite;
    cfg.export.encrypt &= !args.no_encrypt;

    // ─── 3) generalise ───────────────────────────────────────────────
    let client = Client::builder()
        .timeout(Duration::from_secs(cfg.postal.timeout_secs))
        .build()
        .context("building HTTP client")?;
    let postal = Arc::new(PostcodesIo::new(client, &cfg.postal.base_url)?);
    let pipeline = Pipeline::from_config(&cfg, postal)?;
    info!(
        input = %cfg.input.display(),
        reference = %pipeline.reference_date(),
        "startup"
    );

    let mut source = CsvFile::new(&cfg.input);
    let anonymised = pipeline.anonymise(&mut source).await?;

    // ─── 4) k-anonymity gate ─────────────────────────────────────────
    let report = pipeline::verify(&anonymised, &cfg.quasi_identifiers, cfg.unresolved_postcodes)?;
    let below = report.below(cfg.k_threshold);
    for g in &below {
        warn!(key = ?g.key, size = g.size, "group below threshold");
    }
    if let Err(e) = pipeline::check_threshold(&report, cfg.k_threshold) {
        if !args.force {
            return Err(e.context("refusing to export (use --force to export anyway)"));
        }
        warn!("{:#}; exporting because --force was given", e);
    }

    // ─── 5) export ───────────────────────────────────────────────────
    let manifest = export::export(
        &cfg.output_dir,
        &anonymised.dataset,
        &anonymised.classification.key_tables(),
        &report,
        &cfg.export,
    )?;

    let summary = RunSummary {
        input: cfg.input.clone(),
        output: manifest.dir.clone(),
        reference_date: pipeline.reference_date(),
        rows: anonymised.dataset.len(),
        quasi_identifiers: report.quasi_identifiers.clone(),
        k: report.k.value(),
        threshold: cfg.k_threshold,
        groups_below_threshold: below.len(),
        excluded_rows: report.excluded,
        out_of_range_cells: anonymised.out_of_range,
        postal: anonymised.postal,
        files: manifest.files.clone(),
        credential: manifest.credential.clone(),
    };
    if let Some(path) = &args.summary {
        let f = File::create(path).with_context(|| format!("creating summary {:?}", path))?;
        serde_json::to_writer_pretty(f, &summary)?;
    }

    println!("rows exported:        {}", summary.rows);
    println!(
        "k ({}): {}",
        summary.quasi_identifiers.join(", "),
        report.k
    );
    println!(
        "postcodes degraded:   {} (unknown prefix {}, no region {}, service failed {})",
        anonymised.postal.degraded(),
        anonymised.postal.unknown_prefix,
        anonymised.postal.no_region,
        anonymised.postal.service_failed
    );
    println!("out-of-range values:  {}", summary.out_of_range_cells);
    println!("output:               {}", manifest.dir.display());
    if let Some(c) = &manifest.credential {
        println!("credential:           {}", c.display());
    }
    info!("done");
    Ok(())
}
