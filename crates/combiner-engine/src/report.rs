//! Tabular projection of duplicate groups for the console table and CSV
//! reports.

use std::path::{Path, PathBuf};

use combiner_core::{CustomerRecord, display_value};
use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::grouping::Buckets;
use crate::path::traverse;

/// Synthetic column holding the normalized full name.
pub const FULL_NAME: &str = "fullName";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Section {
    pub title: String,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteReport {
    pub site: String,
    pub title: String,
    pub sections: Vec<Section>,
}

/// Split a `--fields` value into column paths.
pub fn parse_fields(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect()
}

/// One cell per field; dotted paths walk nested values, missing values are blank.
pub fn project(record: &CustomerRecord, fields: &[String]) -> Vec<String> {
    fields
        .iter()
        .map(|field| {
            if field == FULL_NAME {
                return record.full_name();
            }
            traverse(record, field).map(|v| display_value(&v)).unwrap_or_default()
        })
        .collect()
}

pub fn build(buckets: &Buckets, by: &str, fields: &[String]) -> Vec<SiteReport> {
    buckets
        .iter()
        .map(|(site, groups)| SiteReport {
            site: site.clone(),
            title: format!("Site: {site} - {}", groups.len()),
            sections: groups
                .values()
                .map(|group| Section {
                    title: format!("Duplicates by {by} {}: {}", group.key, group.len()),
                    rows: group.members.iter().map(|m| project(m, fields)).collect(),
                })
                .collect(),
        })
        .collect()
}

/// CRM URL reduced to a file-name fragment: scheme and slashes dropped,
/// dots replaced by underscores.
pub fn crm_name(url: &str) -> String {
    url.replace("https:", "")
        .replace("http:", "")
        .replace('/', "")
        .replace('.', "_")
}

pub fn csv_path(dir: &Path, crm: &str, by: &str, site: &str) -> PathBuf {
    dir.join(format!("{crm}_by_{by}_{site}.csv"))
}

/// Header row, then per group a title row followed by its member rows.
pub fn write_csv(report: &SiteReport, fields: &[String], path: &Path) -> Result<()> {
    let to_err = |e: csv::Error| EngineError::Report(format!("{}: {e}", path.display()));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| EngineError::Report(format!("{}: {e}", parent.display())))?;
    }

    let mut wtr = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(to_err)?;
    wtr.write_record(fields).map_err(to_err)?;
    for section in &report.sections {
        wtr.write_record([section.title.as_str()]).map_err(to_err)?;
        for row in &section.rows {
            wtr.write_record(row).map_err(to_err)?;
        }
    }
    wtr.flush()
        .map_err(|e| EngineError::Report(format!("{}: {e}", path.display())))?;
    Ok(())
}

/// Write one CSV per site and return the written paths.
pub fn write_reports(reports: &[SiteReport], fields: &[String], dir: &Path, crm: &str, by: &str) -> Result<Vec<PathBuf>> {
    reports
        .iter()
        .map(|report| {
            let path = csv_path(dir, crm, by, &report.site);
            write_csv(report, fields, &path)?;
            Ok(path)
        })
        .collect()
}
