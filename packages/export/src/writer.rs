//! All-or-nothing CSV writer for the three export tables.
//!
//! Each table is written to a `.tmp` sibling first. Only once all three are
//! complete are they moved into place. Existing files are set aside as
//! `.bak` siblings during the move and restored if any move fails, so a
//! failed run leaves the previous export untouched.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::{ExportError, ExportTables};

const COUNTS_HEADER: &[&str] = &["year", "type", "division", "ward", "n"];
const TOP_HEADER: &[&str] = &["year", "type", "n"];
const DAILY_HEADER: &[&str] = &["day", "n"];

/// Final locations of the three export tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPaths {
    /// `year,type,division,ward,n`
    pub counts: PathBuf,
    /// `year,type,n`
    pub top_by_year: PathBuf,
    /// `day,n`
    pub daily: PathBuf,
}

impl ExportPaths {
    /// Builds the file names from `prefix` and the span of `wanted_years`,
    /// e.g. `311_daily_totals_2021_2025.csv`.
    #[must_use]
    pub fn new(dir: &Path, prefix: &str, wanted_years: &BTreeSet<i32>) -> Self {
        let range = match (wanted_years.first(), wanted_years.last()) {
            (Some(min), Some(max)) => format!("_{min}_{max}"),
            _ => String::new(),
        };
        let file = |stem: &str| dir.join(format!("{prefix}_{stem}{range}.csv"));

        Self {
            counts: file("counts_year_type_division_ward"),
            top_by_year: file("top_types_by_year"),
            daily: file("daily_totals"),
        }
    }

    /// The three paths in write order.
    #[must_use]
    pub fn all(&self) -> [&Path; 3] {
        [&self.counts, &self.top_by_year, &self.daily]
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

fn tmp_path(path: &Path) -> PathBuf {
    sibling(path, ".tmp")
}

fn bak_path(path: &Path) -> PathBuf {
    sibling(path, ".bak")
}

fn io_error(path: &Path, source: std::io::Error) -> ExportError {
    ExportError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Writes all three tables, or none of them.
///
/// # Errors
///
/// Returns [`ExportError::Io`] or [`ExportError::Csv`] if the directory
/// cannot be created or any table cannot be written or moved into place.
/// On error every final path holds what it held before the call and the
/// temporaries are removed.
pub fn write_exports(paths: &ExportPaths, tables: &ExportTables) -> Result<(), ExportError> {
    for parent in paths.all().iter().filter_map(|p| p.parent()) {
        if parent.as_os_str().is_empty() {
            continue;
        }
        std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }

    if let Err(e) = stage_all(paths, tables) {
        discard_temporaries(paths);
        return Err(e);
    }

    if let Err(e) = commit(paths) {
        discard_temporaries(paths);
        return Err(e);
    }

    for path in paths.all() {
        log::info!("Wrote {}", path.display());
    }

    Ok(())
}

/// Moves the staged temporaries over the final paths.
///
/// Existing regular files are renamed to `.bak` first. If any step fails,
/// files already moved in are removed and the backups are renamed back.
fn commit(paths: &ExportPaths) -> Result<(), ExportError> {
    let mut backed_up: Vec<&Path> = Vec::new();
    let mut installed: Vec<&Path> = Vec::new();

    let result = move_into_place(paths, &mut backed_up, &mut installed);

    if let Err(e) = result {
        log::warn!("Export could not be moved into place, restoring previous files");
        for path in &installed {
            std::fs::remove_file(path).ok();
        }
        for path in &backed_up {
            if let Err(restore) = std::fs::rename(bak_path(path), path) {
                log::error!(
                    "Could not restore {} from {}: {restore}",
                    path.display(),
                    bak_path(path).display()
                );
            }
        }
        return Err(e);
    }

    for path in backed_up {
        std::fs::remove_file(bak_path(path)).ok();
    }

    Ok(())
}

fn move_into_place<'a>(
    paths: &'a ExportPaths,
    backed_up: &mut Vec<&'a Path>,
    installed: &mut Vec<&'a Path>,
) -> Result<(), ExportError> {
    for path in paths.all() {
        if path.is_file() {
            std::fs::rename(path, bak_path(path)).map_err(|e| io_error(path, e))?;
            backed_up.push(path);
        }
    }
    for path in paths.all() {
        std::fs::rename(tmp_path(path), path).map_err(|e| io_error(path, e))?;
        installed.push(path);
    }
    Ok(())
}

fn stage_all(paths: &ExportPaths, tables: &ExportTables) -> Result<(), ExportError> {
    write_table(&tmp_path(&paths.counts), COUNTS_HEADER, &tables.counts)?;
    write_table(&tmp_path(&paths.top_by_year), TOP_HEADER, &tables.top_by_year)?;
    write_table(&tmp_path(&paths.daily), DAILY_HEADER, &tables.daily)?;
    Ok(())
}

fn discard_temporaries(paths: &ExportPaths) {
    for path in paths.all() {
        let tmp = tmp_path(path);
        if tmp.is_file() {
            std::fs::remove_file(&tmp).ok();
        }
    }
}

/// Writes the header explicitly so empty tables still get one.
fn write_table<R: Serialize>(path: &Path, header: &[&str], rows: &[R]) -> Result<(), ExportError> {
    let csv_err = |source| ExportError::Csv {
        path: path.display().to_string(),
        source,
    };

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(csv_err)?;

    writer.write_record(header).map_err(csv_err)?;
    for row in rows {
        writer.serialize(row).map_err(csv_err)?;
    }
    writer.flush().map_err(|e| ExportError::Io {
        path: path.display().to_string(),
        source: e,
    })?;

    log::debug!("Staged {} rows in {}", rows.len(), path.display());

    Ok(())
}
