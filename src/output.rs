//! JSON Lines output files for harvested record sets.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use harvester_core::{FinalRecordSet, HarvestOutput, RawRecord};
use serde::Serialize;
use tracing::{debug, info};

/// Prefix of the combined file in search mode.
const COMBINED_SEARCH_PREFIX: &str = "both";

/// Name of the combined file in bulk mode (without extension).
const COMBINED_BULK_NAME: &str = "combined";

/// One output line: the record plus its resolver link.
#[derive(Debug, Serialize)]
struct OutputRecord<'a> {
    #[serde(flatten)]
    record: &'a RawRecord,
    doi_url: String,
}

/// File name for a set: `<prefix>_<target>_extract.jsonl` in search mode,
/// `<prefix>.jsonl` otherwise.
pub(crate) fn output_file_name(prefix: &str, target: Option<&str>) -> String {
    match target {
        Some(target) => format!("{prefix}_{}_extract.jsonl", sanitize_target(target)),
        None => format!("{prefix}.jsonl"),
    }
}

fn sanitize_target(target: &str) -> String {
    target
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .replace(['/', '\\'], "_")
}

/// Writes `records` to `path`, one JSON object per line. Returns the number
/// of lines written. An empty set produces an empty file.
pub(crate) fn write_jsonl(path: &Path, records: &FinalRecordSet) -> Result<usize> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create output file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for record in records {
        let line = OutputRecord {
            record,
            doi_url: record.doi_url(),
        };
        serde_json::to_writer(&mut writer, &line)
            .with_context(|| format!("Failed to encode record {}", record.doi))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    debug!(path = %path.display(), records = records.len(), "output file written");
    Ok(records.len())
}

/// Writes every set in `output` under `outdir` and returns the paths written.
pub(crate) fn write_output(
    outdir: &Path,
    output: &HarvestOutput,
    target: Option<&str>,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(outdir)
        .with_context(|| format!("Failed to create output directory {}", outdir.display()))?;

    let mut written = Vec::new();
    for set in &output.per_server {
        let path = outdir.join(output_file_name(set.server.as_str(), target));
        let count = write_jsonl(&path, &set.records)?;
        info!(server = %set.server, records = count, path = %path.display(), "wrote records");
        written.push(path);
    }

    if let Some(combined) = &output.combined {
        let prefix = if target.is_some() {
            COMBINED_SEARCH_PREFIX
        } else {
            COMBINED_BULK_NAME
        };
        let path = outdir.join(output_file_name(prefix, target));
        let count = write_jsonl(&path, combined)?;
        info!(records = count, path = %path.display(), "wrote combined records");
        written.push(path);
    }
    Ok(written)
}
