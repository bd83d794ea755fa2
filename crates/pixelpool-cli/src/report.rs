//! Conversion report: per-file outcomes, totals and their rendering.

use std::path::PathBuf;

use serde::Serialize;

use crate::colors;

/// Outcome of one input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "status")]
pub enum FileStatus {
    Done { output: PathBuf, converted_bytes: u64 },
    Error { error: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub input: PathBuf,
    pub original_bytes: u64,
    #[serde(flatten)]
    pub status: FileStatus,
}

/// Aggregate sizes over every file that was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Totals {
    pub converted_files: usize,
    pub failed_files: usize,
    pub skipped_files: usize,
    pub original_bytes: u64,
    pub converted_bytes: u64,
    /// Bytes saved, never negative.
    pub saved_bytes: u64,
    /// Saved bytes as a rounded percentage of the original size.
    pub saved_percent: u64,
}

impl Totals {
    pub fn from_files(files: &[FileReport]) -> Self {
        let mut totals = Totals::default();

        for file in files {
            match &file.status {
                FileStatus::Skipped { .. } => {
                    totals.skipped_files += 1;
                    continue;
                }
                FileStatus::Error { .. } => totals.failed_files += 1,
                FileStatus::Done { converted_bytes, .. } => {
                    totals.converted_files += 1;
                    totals.converted_bytes += converted_bytes;
                }
            }
            totals.original_bytes += file.original_bytes;
        }

        totals.saved_bytes = totals.original_bytes.saturating_sub(totals.converted_bytes);
        if totals.saved_bytes > 0 {
            totals.saved_percent =
                (totals.saved_bytes as f64 / totals.original_bytes as f64 * 100.0).round() as u64;
        }
        totals
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub files: Vec<FileReport>,
    pub totals: Totals,
}

impl Report {
    pub fn new(files: Vec<FileReport>) -> Self {
        let totals = Totals::from_files(&files);
        Self { files, totals }
    }

    pub fn has_failures(&self) -> bool {
        self.totals.failed_files > 0
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn print(&self) {
        println!("\n{}Results:{}", colors::BOLD, colors::RESET);
        println!("{}", "─".repeat(50));

        for file in &self.files {
            let name = file.input.display();
            match &file.status {
                FileStatus::Done {
                    output,
                    converted_bytes,
                } => println!(
                    "{}done{}    {} → {} ({} → {})",
                    colors::GREEN,
                    colors::RESET,
                    name,
                    output.display(),
                    format_bytes(file.original_bytes),
                    format_bytes(*converted_bytes)
                ),
                FileStatus::Error { error } => println!(
                    "{}error{}   {}: {}",
                    colors::RED,
                    colors::RESET,
                    name,
                    error
                ),
                FileStatus::Skipped { reason } => println!(
                    "{}skipped{} {}{}: {}{}",
                    colors::YELLOW,
                    colors::RESET,
                    name,
                    colors::DIM,
                    reason,
                    colors::RESET
                ),
            }
        }

        let totals = &self.totals;
        println!("{}", "─".repeat(50));
        println!(
            "Converted {} file(s), {} failed, {} skipped",
            totals.converted_files, totals.failed_files, totals.skipped_files
        );
        println!(
            "Original {} → converted {}, saved {} ({}%)",
            format_bytes(totals.original_bytes),
            format_bytes(totals.converted_bytes),
            format_bytes(totals.saved_bytes),
            totals.saved_percent
        );
    }
}

/// Human-readable size using 1024-based units.
///
/// Two decimals below 10 of a unit, one decimal otherwise.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if value < 10.0 {
        format!("{:.2} {}", value, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done(original: u64, converted: u64) -> FileReport {
        FileReport {
            input: PathBuf::from("a.png"),
            original_bytes: original,
            status: FileStatus::Done {
                output: PathBuf::from("a.webp"),
                converted_bytes: converted,
            },
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512.0 B");
        assert_eq!(format_bytes(5), "5.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(20 * 1024 * 1024), "20.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
        assert_eq!(format_bytes(5000 * 1024 * 1024 * 1024), "5000.0 GB");
    }

    #[test]
    fn test_totals_include_failures_but_not_skips() {
        let files = vec![
            done(1000, 250),
            FileReport {
                input: PathBuf::from("b.png"),
                original_bytes: 1000,
                status: FileStatus::Error {
                    error: "bad".to_string(),
                },
            },
            FileReport {
                input: PathBuf::from("huge.png"),
                original_bytes: 50_000_000,
                status: FileStatus::Skipped {
                    reason: "too large".to_string(),
                },
            },
        ];

        let totals = Totals::from_files(&files);
        assert_eq!(totals.converted_files, 1);
        assert_eq!(totals.failed_files, 1);
        assert_eq!(totals.skipped_files, 1);
        assert_eq!(totals.original_bytes, 2000);
        assert_eq!(totals.converted_bytes, 250);
        assert_eq!(totals.saved_bytes, 1750);
        assert_eq!(totals.saved_percent, 88);
    }

    #[test]
    fn test_growth_saves_nothing() {
        let totals = Totals::from_files(&[done(100, 400)]);
        assert_eq!(totals.saved_bytes, 0);
        assert_eq!(totals.saved_percent, 0);
    }

    #[test]
    fn test_json_shape() {
        let report = Report::new(vec![done(100, 40)]);
        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();

        assert_eq!(value["files"][0]["status"], "done");
        assert_eq!(value["files"][0]["converted_bytes"], 40);
        assert_eq!(value["files"][0]["original_bytes"], 100);
        assert_eq!(value["totals"]["saved_percent"], 60);
        assert!(!report.has_failures());
    }
}
