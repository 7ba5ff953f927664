// src/export/mod.rs
use anyhow::{Context, Result};
use arrow::{
    array::{ArrayRef, StringArray},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use chrono::Utc;
use parquet::{arrow::ArrowWriter, basic::Compression, file::properties::WriterProperties};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{Cursor, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, error, info, warn};
use zip::{write::SimpleFileOptions, AesMode, CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{AnonError, AnonResult};
use crate::generalise::KeyTable;
use crate::kanon::{Dataset, KReport};
use crate::load::read_csv;

pub const DATASET_CSV: &str = "cleaned_data.csv";
pub const DATASET_PARQUET: &str = "cleaned_data.parquet";
pub const DATASET_ZIP: &str = "data.zip";
pub const KEYS_DIR: &str = "keys";
pub const KEYS_ZIP: &str = "keys.zip";
pub const K_REPORT: &str = "k_anonymity.txt";
const PASSWORD_LEN: usize = 20;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    /// Wrap the dataset in an AES-256 zip with a generated password.
    pub encrypt: bool,
    /// File name for the generated password, next to the archive.
    pub credential_file: String,
    /// Also write a Parquet copy of the dataset.
    pub parquet: bool,
    /// Replace an existing output directory.
    pub overwrite: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            encrypt: true,
            credential_file: "credential.txt".into(),
            parquet: false,
            overwrite: false,
        }
    }
}

/// What ended up on disk.
#[derive(Clone, Debug, Default)]
pub struct ExportManifest {
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
    pub credential: Option<PathBuf>,
}

/// Every token in a tokenised column must have a key-table entry.
pub fn check_integrity(data: &Dataset, key_tables: &[(&str, &KeyTable)]) -> AnonResult<()> {
    for (column, table) in key_tables {
        let values = data.column(column).ok_or_else(|| {
            AnonError::ExportIntegrity(format!(
                "key table `{}` refers to missing column `{}`",
                table.name(),
                column
            ))
        })?;
        for (row, token) in values.enumerate() {
            if !table.contains_token(token) {
                return Err(AnonError::ExportIntegrity(format!(
                    "row {}: token {:?} in `{}` has no entry in key table `{}`",
                    row,
                    token,
                    column,
                    table.name()
                )));
            }
        }
    }
    Ok(())
}

/// Write the dataset, key tables and k report into `out_dir`.
///
/// Everything is assembled in a staging directory next to `out_dir` and moved
/// into place with one rename, so a failure leaves no partial output behind.
#[tracing::instrument(level = "info", skip_all, fields(out = %out_dir.display(), rows = data.len()))]
pub fn export(
    out_dir: &Path,
    data: &Dataset,
    key_tables: &[(&str, &KeyTable)],
    report: &KReport,
    opts: &ExportOptions,
) -> Result<ExportManifest> {
    check_integrity(data, key_tables)?;

    if out_dir.exists() && !opts.overwrite {
        anyhow::bail!(
            "output directory {} already exists (set overwrite to replace it)",
            out_dir.display()
        );
    }
    let parent = match out_dir.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .with_context(|| format!("creating parent directory {:?}", parent))?;

    let staging = tempfile::Builder::new()
        .prefix(".surveyanon-staging-")
        .tempdir_in(&parent)
        .with_context(|| format!("creating staging directory in {:?}", parent))?;
    let stage = staging.path();
    let mut staged: Vec<PathBuf> = Vec::new();
    let mut credential = None;

    // 1) dataset
    let csv_bytes = dataset_csv(data)?;
    let parquet_bytes = if opts.parquet {
        Some(dataset_parquet(data)?)
    } else {
        None
    };

    if opts.encrypt {
        let password = generate_password(PASSWORD_LEN);
        let mut entries: Vec<(&str, &[u8])> = vec![(DATASET_CSV, csv_bytes.as_slice())];
        if let Some(pq) = &parquet_bytes {
            entries.push((DATASET_PARQUET, pq.as_slice()));
        }
        let archive = zip_entries(&entries, Some(&password))?;
        staged.push(write_readonly(&stage.join(DATASET_ZIP), &archive)?);

        let cred_path = stage.join(&opts.credential_file);
        fs::write(&cred_path, &password)
            .with_context(|| format!("writing credential file {:?}", cred_path))?;
        credential = Some(out_dir.join(&opts.credential_file));
        staged.push(cred_path);
    } else {
        staged.push(write_readonly(&stage.join(DATASET_CSV), &csv_bytes)?);
        if let Some(pq) = &parquet_bytes {
            staged.push(write_readonly(&stage.join(DATASET_PARQUET), pq)?);
        }
    }

    // 2) key tables, one file each, then bundled
    let keys_dir = stage.join(KEYS_DIR);
    fs::create_dir_all(&keys_dir).context("creating keys directory")?;
    let mut key_files: Vec<(String, Vec<u8>)> = Vec::with_capacity(key_tables.len());
    for (_, table) in key_tables {
        let name = format!("{}.csv", table.name());
        let bytes = key_table_csv(table)?;
        staged.push(write_readonly(&keys_dir.join(&name), &bytes)?);
        key_files.push((format!("{}/{}", KEYS_DIR, name), bytes));
    }
    let key_entries: Vec<(&str, &[u8])> = key_files
        .iter()
        .map(|(n, b)| (n.as_str(), b.as_slice()))
        .collect();
    staged.push(write_readonly(
        &stage.join(KEYS_ZIP),
        &zip_entries(&key_entries, None)?,
    )?);

    // 3) minimum group size
    staged.push(write_readonly(
        &stage.join(K_REPORT),
        format!("{}\n", report.k).as_bytes(),
    )?);
    debug!(files = staged.len(), "staged export");

    // 4) commit
    commit(stage, out_dir, opts.overwrite)?;

    let files = staged
        .iter()
        .filter_map(|p| p.strip_prefix(stage).ok())
        .map(|rel| out_dir.join(rel))
        .collect::<Vec<_>>();
    info!(files = files.len(), encrypted = opts.encrypt, "export complete");

    Ok(ExportManifest {
        dir: out_dir.to_path_buf(),
        files,
        credential,
    })
}

/// Move the staged directory over `out_dir`.
fn commit(stage: &Path, out_dir: &Path, overwrite: bool) -> Result<()> {
    let backup = if overwrite && out_dir.exists() {
        let name = out_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "export".into());
        let backup = out_dir.with_file_name(format!(
            ".{}.replaced-{}",
            name,
            Utc::now().timestamp_micros()
        ));
        fs::rename(out_dir, &backup)
            .with_context(|| format!("moving aside existing {:?}", out_dir))?;
        Some(backup)
    } else {
        None
    };

    if let Err(e) = fs::rename(stage, out_dir) {
        if let Some(b) = &backup {
            if let Err(restore) = fs::rename(b, out_dir) {
                error!(
                    backup = %b.display(),
                    error = %restore,
                    "failed to restore previous export; it is left at the backup path"
                );
            }
        }
        return Err(e).with_context(|| format!("renaming {:?} -> {:?}", stage, out_dir));
    }

    if let Some(b) = backup {
        if let Err(e) = fs::remove_dir_all(&b) {
            warn!("failed to remove replaced export {}: {}", b.display(), e);
        }
    }
    Ok(())
}

fn write_readonly(path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    let mut file = File::create(path).with_context(|| format!("creating {:?}", path))?;
    file.write_all(bytes)
        .with_context(|| format!("writing {:?}", path))?;
    file.sync_all()?;
    let mut perms = file.metadata()?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms).with_context(|| format!("marking {:?} read-only", path))?;
    Ok(path.to_path_buf())
}

pub fn dataset_csv(data: &Dataset) -> Result<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(&data.columns)?;
    for row in &data.rows {
        wtr.write_record(row)?;
    }
    wtr.into_inner().context("flushing dataset CSV")
}

pub fn key_table_csv(table: &KeyTable) -> Result<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    let (token_header, original_header) = table.headers();
    wtr.write_record([token_header, original_header])?;
    for (token, original) in table.pairs() {
        wtr.write_record([token, original])?;
    }
    wtr.into_inner()
        .with_context(|| format!("flushing key table {}", table.name()))
}

/// Utf8 columns, Snappy compressed.
pub fn dataset_parquet(data: &Dataset) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(
        data.columns
            .iter()
            .map(|c| Field::new(c, DataType::Utf8, false))
            .collect::<Vec<_>>(),
    ));
    let arrays: Vec<ArrayRef> = (0..data.columns.len())
        .map(|i| {
            Arc::new(StringArray::from_iter_values(
                data.rows.iter().map(|r| r[i].as_str()),
            )) as ArrayRef
        })
        .collect();
    let batch =
        RecordBatch::try_new(schema.clone(), arrays).context("building dataset record batch")?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(Vec::new(), schema, Some(props))
        .context("creating Arrow writer for dataset")?;
    writer.write(&batch).context("writing dataset batch")?;
    writer.into_inner().context("closing dataset writer")
}

fn zip_entries(entries: &[(&str, &[u8])], password: Option<&str>) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, bytes) in entries {
        let base = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let options = match password {
            Some(pw) => base.with_aes_encryption(AesMode::Aes256, pw),
            None => base,
        };
        zip.start_file(*name, options)
            .with_context(|| format!("starting zip entry {}", name))?;
        zip.write_all(bytes)?;
    }
    Ok(zip.finish().context("finishing zip archive")?.into_inner())
}

/// Read a dataset back from an export: either the plain CSV or the
/// `data.zip` archive, which needs `password` when encrypted.
pub fn read_dataset(path: &Path, password: Option<&str>) -> Result<Dataset> {
    let file = File::open(path).with_context(|| format!("opening {:?}", path))?;
    let is_zip = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"));
    let table = if is_zip {
        let mut archive = ZipArchive::new(file).with_context(|| format!("reading {:?}", path))?;
        let entry = match password {
            Some(pw) => archive.by_name_decrypt(DATASET_CSV, pw.as_bytes()),
            None => archive.by_name(DATASET_CSV),
        }
        .with_context(|| format!("opening {} in {:?}", DATASET_CSV, path))?;
        read_csv(entry)?
    } else {
        read_csv(file)?
    };
    let mut data = Dataset::new(table.headers);
    data.rows = table.rows;
    Ok(data)
}

/// Random alphanumeric credential.
pub fn generate_password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kanon::{verify, KLevel};
    use std::io::Read;
    use tempfile::TempDir;

    fn colours() -> KeyTable {
        KeyTable::new(
            "edukeytable",
            ("Color", "Education Level"),
            [("Grey", "compulsory"), ("White", "undergraduate")],
        )
        .unwrap()
    }

    fn data(tokens: &[&str]) -> Dataset {
        Dataset {
            columns: vec!["gender".into(), "education_level".into()],
            rows: tokens
                .iter()
                .map(|t| vec!["female".to_string(), t.to_string()])
                .collect(),
        }
    }

    fn report(d: &Dataset) -> KReport {
        verify(d, &["gender".to_string()], &[]).unwrap()
    }

    fn plain() -> ExportOptions {
        ExportOptions {
            encrypt: false,
            ..ExportOptions::default()
        }
    }

    #[test]
    fn test_integrity_mismatch_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let table = colours();
        let d = data(&["Grey", "Purple"]);

        let err = export(&out, &d, &[("education_level", &table)], &report(&d), &plain())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AnonError>(),
            Some(AnonError::ExportIntegrity(_))
        ));
        assert!(!out.exists());
        // no staging leftovers either
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_plain_export_layout() -> Result<()> {
        let tmp = TempDir::new()?;
        let out = tmp.path().join("out");
        let table = colours();
        let d = data(&["Grey", "White", "Grey"]);

        let manifest = export(&out, &d, &[("education_level", &table)], &report(&d), &plain())?;
        assert!(manifest.credential.is_none());

        let csv = fs::read_to_string(out.join(DATASET_CSV))?;
        assert_eq!(
            csv,
            "gender,education_level\nfemale,Grey\nfemale,White\nfemale,Grey\n"
        );
        let keys = fs::read_to_string(out.join(KEYS_DIR).join("edukeytable.csv"))?;
        assert_eq!(keys, "Color,Education Level\nGrey,compulsory\nWhite,undergraduate\n");
        assert_eq!(fs::read_to_string(out.join(K_REPORT))?, "3\n");
        assert!(fs::metadata(out.join(DATASET_CSV))?.permissions().readonly());
        assert!(out.join(KEYS_ZIP).exists());
        Ok(())
    }

    #[test]
    fn test_encrypted_export_needs_password() -> Result<()> {
        let tmp = TempDir::new()?;
        let out = tmp.path().join("out");
        let table = colours();
        let d = data(&["White"]);
        let opts = ExportOptions {
            parquet: true,
            ..ExportOptions::default()
        };

        let manifest = export(&out, &d, &[("education_level", &table)], &report(&d), &opts)?;
        assert!(!out.join(DATASET_CSV).exists());
        let password = fs::read_to_string(manifest.credential.expect("credential file"))?;
        assert_eq!(password.len(), PASSWORD_LEN);

        let mut archive = ZipArchive::new(File::open(out.join(DATASET_ZIP))?)?;
        assert_eq!(archive.len(), 2);
        let mut contents = String::new();
        archive
            .by_name_decrypt(DATASET_CSV, password.as_bytes())?
            .read_to_string(&mut contents)?;
        assert_eq!(contents, "gender,education_level\nfemale,White\n");
        Ok(())
    }

    #[test]
    fn test_existing_output_requires_overwrite() -> Result<()> {
        let tmp = TempDir::new()?;
        let out = tmp.path().join("out");
        let table = colours();
        let d = data(&["Grey"]);
        let keys = [("education_level", &table)];

        export(&out, &d, &keys, &report(&d), &plain())?;
        assert!(export(&out, &d, &keys, &report(&d), &plain()).is_err());

        let d2 = data(&["White", "White"]);
        let opts = ExportOptions {
            overwrite: true,
            ..plain()
        };
        export(&out, &d2, &keys, &report(&d2), &opts)?;
        assert_eq!(fs::read_to_string(out.join(K_REPORT))?, "2\n");
        Ok(())
    }

    #[test]
    fn test_failed_commit_restores_previous_export() -> Result<()> {
        let tmp = TempDir::new()?;
        let out = tmp.path().join("out");
        fs::create_dir(&out)?;
        fs::write(out.join(K_REPORT), "7\n")?;

        let missing_stage = tmp.path().join("never-staged");
        assert!(commit(&missing_stage, &out, true).is_err());
        assert_eq!(fs::read_to_string(out.join(K_REPORT))?, "7\n");
        let leftovers = fs::read_dir(tmp.path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("replaced"))
            .count();
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[test]
    fn test_empty_dataset_reports_undefined() -> Result<()> {
        let tmp = TempDir::new()?;
        let out = tmp.path().join("out");
        let d = data(&[]);
        let r = report(&d);
        assert_eq!(r.k, KLevel::Undefined);

        export(&out, &d, &[], &r, &plain())?;
        assert_eq!(fs::read_to_string(out.join(K_REPORT))?, "undefined\n");
        Ok(())
    }

    #[test]
    fn test_parquet_copy_round_trips_row_count() -> Result<()> {
        use parquet::file::reader::{FileReader, SerializedFileReader};

        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(&dataset_parquet(&data(&["Grey", "White"]))?)?;
        let reader = SerializedFileReader::new(File::open(tmp.path())?)?;
        assert_eq!(reader.metadata().file_metadata().num_rows(), 2);
        Ok(())
    }

    #[test]
    fn test_read_dataset_from_archive() -> Result<()> {
        let tmp = TempDir::new()?;
        let out = tmp.path().join("out");
        let table = colours();
        let d = data(&["Grey", "White", "Grey"]);
        let manifest = export(
            &out,
            &d,
            &[("education_level", &table)],
            &report(&d),
            &ExportOptions::default(),
        )?;
        let password = fs::read_to_string(manifest.credential.as_ref().unwrap())?;

        let zipped = out.join(DATASET_ZIP);
        assert!(read_dataset(&zipped, Some("wrong-password")).is_err());
        let back = read_dataset(&zipped, Some(&password))?;
        assert_eq!(back, d);
        Ok(())
    }

    #[test]
    fn test_password_alphabet() {
        let pw = generate_password(64);
        assert_eq!(pw.len(), 64);
        assert!(pw.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
