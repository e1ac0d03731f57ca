//! Manifest codec
//!
//! Reads and writes the line-oriented text formats used by a collection:
//!
//! ```text
//! # manifest: <length>,<modified-ms>,<sha1-hex>,<path>
//! 10,1600000000000,7c211433f02071597741e6ff5a8ea34789abbf43,./a.txt
//! 0,1600000000000,0000000000000000000000000000000000000000,./b
//!
//! # bundle: <modified-ms>,<path>
//! 1600000000000,./nested
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. A line with the wrong
//! number of fields is reported with a warning and skipped; the rest of the
//! file still loads.
//!
//! A package directive file is a manifest whose leading `#` lines, with the
//! marker stripped and concatenated, form a JSON header naming the source URI.

use crate::config::{self, CHECKSUM_FILE};
use crate::error::{MimicError, Result};
use crate::types::{BundleRecord, Manifest, ManifestRecord};
use crate::utils;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, warn};

/// Fields in a manifest line
pub const MANIFEST_FIELDS: usize = 4;

/// Fields in a bundle line
pub const BUNDLE_FIELDS: usize = 2;

/// Header of a package directive file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageDirective {
    /// Base URI the package records are fetched from
    pub uri: String,
    /// Any other header fields, kept verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Split a non-skip line into at most `count` fields, or `None` for blank
/// and comment lines
///
/// The path is always the last field and keeps any commas it contains.
fn fields(line: &str, count: usize) -> Option<Vec<&str>> {
    let trimmed = line.trim_start();
    if trimmed.trim_end().is_empty() || trimmed.starts_with('#') {
        return None;
    }
    Some(trimmed.trim_end_matches(['\r', '\n']).splitn(count, ',').collect())
}

/// Parse an integer field, flooring historic fractional millisecond values
fn parse_number(field: &str, name: &str, line: usize) -> Result<u64> {
    let field = field.trim();
    if let Ok(value) = field.parse::<u64>() {
        return Ok(value);
    }
    match field.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(value.floor() as u64),
        _ => Err(MimicError::MalformedField {
            line,
            reason: format!("{} '{}' is not a non-negative number", name, field),
        }),
    }
}

/// Parse one manifest line
///
/// Returns `Ok(None)` for blank and comment lines. `line_no` is only used in
/// error messages.
pub fn parse_record(line: &str, line_no: usize) -> Result<Option<ManifestRecord>> {
    let Some(parts) = fields(line, MANIFEST_FIELDS) else {
        return Ok(None);
    };
    if parts.len() != MANIFEST_FIELDS {
        return Err(MimicError::MalformedRecord {
            line: line_no,
            found: parts.len(),
            expected: MANIFEST_FIELDS,
        });
    }
    Ok(Some(ManifestRecord {
        length: parse_number(parts[0], "length", line_no)?,
        modified: parse_number(parts[1], "modified", line_no)?,
        checksum: parts[2].to_string(),
        path: parts[3].to_string(),
    }))
}

/// Parse one bundle line
pub fn parse_bundle_record(line: &str, line_no: usize) -> Result<Option<BundleRecord>> {
    let Some(parts) = fields(line, BUNDLE_FIELDS) else {
        return Ok(None);
    };
    if parts.len() != BUNDLE_FIELDS {
        return Err(MimicError::MalformedRecord {
            line: line_no,
            found: parts.len(),
            expected: BUNDLE_FIELDS,
        });
    }
    Ok(Some(BundleRecord {
        modified: parse_number(parts[0], "modified", line_no)?,
        path: parts[1].to_string(),
    }))
}

/// Parse manifest text, skipping malformed lines with a warning
pub fn parse_manifest<R: BufRead>(reader: R) -> Result<Manifest> {
    let mut manifest = Manifest::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        match parse_record(&line, index + 1) {
            Ok(Some(record)) => {
                manifest.insert(record);
            }
            Ok(None) => {}
            Err(e) => warn!("Skipping manifest line: {}", e),
        }
    }
    Ok(manifest)
}

/// Render a manifest, one record per line
///
/// `descending` emits children before their parents.
pub fn format_manifest(manifest: &Manifest, descending: bool) -> String {
    let mut out = String::with_capacity(manifest.len() * 80);
    let records: Box<dyn Iterator<Item = &ManifestRecord>> = if descending {
        Box::new(manifest.descending())
    } else {
        Box::new(manifest.iter())
    };
    for record in records {
        out.push_str(&record.to_string());
        out.push('\n');
    }
    out
}

/// Load a manifest from an explicit file
pub fn load_from(path: &Path) -> Result<Manifest> {
    let file = File::open(path)?;
    let manifest = parse_manifest(BufReader::new(file))?;
    debug!("Loaded {} records from {:?}", manifest.len(), path);
    Ok(manifest)
}

/// Load the manifest of the collection managing `path`
///
/// An absent manifest file is created empty.
pub fn load(path: &Path) -> Result<Manifest> {
    let root = config::require_root(path)?;
    let manifest_path = root.join(CHECKSUM_FILE);
    if !manifest_path.exists() {
        debug!("Creating empty manifest {:?}", manifest_path);
        File::create(&manifest_path)?;
    }
    load_from(&manifest_path)
}

/// Write a manifest to an explicit file in ascending order
pub fn store_to(path: &Path, manifest: &Manifest) -> Result<()> {
    utils::atomic_write(path, format_manifest(manifest, false).as_bytes())?;
    debug!("Stored {} records to {:?}", manifest.len(), path);
    Ok(())
}

/// Replace the manifest of the collection managing `path`
pub fn store(path: &Path, manifest: &Manifest) -> Result<()> {
    let root = config::require_root(path)?;
    store_to(&root.join(CHECKSUM_FILE), manifest)
}

/// Read the JSON header of a package directive file
pub fn load_directives(path: &Path) -> Result<PackageDirective> {
    let reader = BufReader::new(File::open(path)?);
    let mut header = String::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        match line.strip_prefix('#') {
            Some(rest) => header.push_str(rest.trim()),
            None => break,
        }
    }
    if header.is_empty() {
        return Err(MimicError::InvalidDirective(format!(
            "{:?} has no '#' header",
            path
        )));
    }
    serde_json::from_str(&header)
        .map_err(|e| MimicError::InvalidDirective(format!("{:?}: {}", path, e)))
}

/// Load a package directive file: header plus records
pub fn load_package(path: &Path) -> Result<(PackageDirective, Manifest)> {
    let directive = load_directives(path)?;
    let manifest = load_from(path)?;
    Ok((directive, manifest))
}
