// src/bin/kcheck.rs
//
// Recompute k-anonymity for an exported dataset.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use std::{fs, path::PathBuf};
use surveyanon::{
    export::read_dataset,
    kanon::{verify, Exclusion},
};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Report equivalence classes of an anonymised dataset")]
struct Args {
    /// `cleaned_data.csv` or `data.zip` from an export directory.
    input: PathBuf,
    /// Quasi-identifier columns, comma separated.
    #[arg(long, value_delimiter = ',', default_value = "gender,banded_age")]
    qi: Vec<String>,
    #[arg(short = 'k', long, default_value_t = 15)]
    threshold: usize,
    /// Skip rows where COLUMN=VALUE; may be repeated.
    #[arg(long, value_name = "COLUMN=VALUE")]
    exclude: Vec<String>,
    /// Password for an encrypted archive.
    #[arg(long, env = "SURVEYANON_PASSWORD", conflicts_with = "credential")]
    password: Option<String>,
    /// File holding the archive password.
    #[arg(long)]
    credential: Option<PathBuf>,
    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct GroupOut<'a> {
    key: &'a [String],
    size: usize,
}

#[derive(Serialize)]
struct ReportOut<'a> {
    quasi_identifiers: &'a [String],
    k: Option<usize>,
    threshold: usize,
    satisfied: bool,
    excluded: usize,
    groups: Vec<GroupOut<'a>>,
}

fn parse_exclusion(raw: &str) -> Result<Exclusion> {
    let Some((column, value)) = raw.split_once('=') else {
        bail!("exclusion `{}` is not COLUMN=VALUE", raw);
    };
    Ok(Exclusion {
        column: column.trim().to_string(),
        value: value.trim().to_string(),
    })
}

fn main() -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let password = match (&args.password, &args.credential) {
        (Some(pw), _) => Some(pw.clone()),
        (None, Some(path)) => Some(
            fs::read_to_string(path)
                .with_context(|| format!("reading credential {:?}", path))?
                .trim()
                .to_string(),
        ),
        (None, None) => None,
    };
    let exclusions = args
        .exclude
        .iter()
        .map(|e| parse_exclusion(e))
        .collect::<Result<Vec<_>>>()?;

    let data = read_dataset(&args.input, password.as_deref())?;
    let report = verify(&data, &args.qi, &exclusions)?;

    if args.json {
        let out = ReportOut {
            quasi_identifiers: &report.quasi_identifiers,
            k: report.k.value(),
            threshold: args.threshold,
            satisfied: report.satisfies(args.threshold),
            excluded: report.excluded,
            groups: report
                .groups
                .iter()
                .map(|g| GroupOut {
                    key: &g.key,
                    size: g.size,
                })
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{}", report.quasi_identifiers.join(" | "));
        for g in &report.groups {
            let flag = if g.size < args.threshold { "  <" } else { "" };
            println!("{:>8}  {}{}", g.size, g.key.join(" | "), flag);
        }
        println!("rows: {}  excluded: {}", data.len(), report.excluded);
        println!("k = {}", report.k);
    }

    if !report.satisfies(args.threshold) {
        std::process::exit(1);
    }
    Ok(())
}
