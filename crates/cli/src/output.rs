//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use shotdrift_core::{CompareStatus, ComparisonResult, RunSummary, UploadReport};

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

impl TableDisplay for ComparisonResult {
    fn headers() -> Vec<&'static str> {
        vec!["Shot", "Status", "Diff pixels", "Diff %", "Attempts", "Detail"]
    }

    fn row(&self) -> Vec<String> {
        let detail = match (&self.error, &self.diff_image_path) {
            (Some(error), _) => error.clone(),
            (None, Some(path)) => path.display().to_string(),
            (None, None) => String::new(),
        };

        vec![
            self.key.to_string(),
            status_label(self.status),
            self.diff_pixel_count.to_string(),
            format!("{:.3}", self.diff_fraction * 100.0),
            self.attempts_used.to_string(),
            detail,
        ]
    }
}

fn status_label(status: CompareStatus) -> String {
    match status {
        CompareStatus::Passed => "✓ passed".green().to_string(),
        CompareStatus::Failed => "✗ failed".red().to_string(),
        CompareStatus::NewBaselineCreated => "+ new baseline".cyan().to_string(),
        CompareStatus::BaselineMissingAndKept => "? no baseline".yellow().to_string(),
        CompareStatus::Error => "! error".red().bold().to_string(),
    }
}

/// Print the run summary
pub fn print_summary(summary: &RunSummary, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if summary.results.is_empty() {
                println!("No shots found.");
            } else {
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL)
                    .set_content_arrangement(ContentArrangement::Dynamic);

                table.set_header(ComparisonResult::headers());
                for result in &summary.results {
                    table.add_row(result.row());
                }

                println!("{table}");
            }

            let counts = &summary.counts;
            println!(
                "{} passed, {} failed, {} new, {} missing baseline, {} error(s) in {} ms",
                counts.passed.to_string().green(),
                counts.failed.to_string().red(),
                counts.new_baseline_created.to_string().cyan(),
                counts.baseline_missing.to_string().yellow(),
                counts.error.to_string().red(),
                summary.duration_ms
            );

            if summary.passed() {
                print_success("Visual regression run passed");
            } else {
                print_error(&format!(
                    "Visual regression run failed ({} shot(s))",
                    summary.failures().count()
                ));
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(summary).unwrap_or_default());
        }
        OutputFormat::Yaml => {
            println!("{}", serde_yaml::to_string(summary).unwrap_or_default());
        }
    }
}

/// Print the upload outcome
pub fn print_upload(report: &UploadReport) {
    for warning in &report.warnings {
        print_warning(warning);
    }

    match (&report.report_id, report.report_incomplete) {
        (Some(id), false) => print_success(&format!("Uploaded {} artifact(s), report {}", report.uploaded, id)),
        _ => print_warning(&format!("Report incomplete: {} artifact(s) uploaded", report.uploaded)),
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("⚠️  {}", message);
}
