//! CLI output formatting for builds and checks.
//!
//! # Output Format
//!
//! ## Build
//!
//! Each scanner prints a header, then one line per file action as workers
//! finish them. Labels are fixed-width so the paths line up:
//!
//! ```text
//! blog: content/blog → site/blog
//!     OK   2020/hello.xml → 2020/hello.html
//!     NC   2020/older.xml → 2020/older.html
//!     IGN  drafts/note.xml
//!     LINK img/logo.png
//! State: site/state (3 written, 1 unchanged)
//!
//! Built 4 files: 1 rebuilt, 1 unchanged, 1 ignored, 1 linked
//! Transforms: 1 compiled, 2 reused (3 lookups)
//! ```
//!
//! ## Check
//!
//! ```text
//! Config OK: 2 rules, 1 scanner, 3 transform programs compiled
//! ```
//!
//! # Architecture
//!
//! Each output has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure.

use crate::config::SiteConfig;
use crate::scanner::{BuildEvent, FileResult, FileStatus};
use crate::site::BuildReport;

// ============================================================================
// Shared helpers
// ============================================================================

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn status_label(status: FileStatus) -> &'static str {
    match status {
        FileStatus::Rebuilt => "OK",
        FileStatus::Unchanged => "NC",
        FileStatus::Ignored => "IGN",
        FileStatus::Linked => "LINK",
    }
}

fn plural(n: usize, word: &str) -> String {
    if n == 1 {
        format!("{n} {word}")
    } else {
        format!("{n} {word}s")
    }
}

/// Ignored files have no output, so the arrow is left out.
fn file_line(file: &FileResult) -> String {
    let label = format!("{:<4}", status_label(file.status));
    match file.status {
        FileStatus::Rebuilt | FileStatus::Unchanged => format!(
            "{}{} {} \u{2192} {}",
            indent(1),
            label,
            file.relpath,
            file.target
        ),
        FileStatus::Ignored | FileStatus::Linked => {
            format!("{}{} {}", indent(1), label, file.relpath)
        }
    }
}

// ============================================================================
// Build
// ============================================================================

/// Format one progress event from a running build.
pub fn format_build_event(event: &BuildEvent) -> Vec<String> {
    match event {
        BuildEvent::ScannerStarted {
            name,
            source,
            target,
        } => vec![format!(
            "{}: {} \u{2192} {}",
            name,
            source.display(),
            target.display()
        )],
        BuildEvent::File(file) => vec![file_line(file)],
        BuildEvent::StatePublished { dir, report } => vec![format!(
            "State: {} ({} written, {} unchanged)",
            dir.display(),
            report.written.len(),
            report.unchanged.len()
        )],
    }
}

/// Format the totals printed after a build.
pub fn format_build_summary(report: &BuildReport) -> Vec<String> {
    let mut lines = vec![String::new()];
    if report.scanners.is_empty() {
        lines.push(format!("No scanners apply to profile `{}`", report.profile));
        return lines;
    }
    lines.push(format!(
        "Built {}: {} rebuilt, {} unchanged, {} ignored, {} linked",
        plural(report.files.len(), "file"),
        report.count(FileStatus::Rebuilt),
        report.count(FileStatus::Unchanged),
        report.count(FileStatus::Ignored),
        report.count(FileStatus::Linked)
    ));
    if report.cache.total() > 0 {
        lines.push(format!("Transforms: {}", report.cache));
    }
    lines
}

pub fn print_build_summary(report: &BuildReport) {
    for line in format_build_summary(report) {
        println!("{}", line);
    }
}

// ============================================================================
// Check
// ============================================================================

pub fn format_check_output(config: &SiteConfig, programs: usize) -> Vec<String> {
    vec![format!(
        "Config OK: {}, {}, {} compiled",
        plural(config.rules.len(), "rule"),
        plural(config.scanners.len(), "scanner"),
        plural(programs, "transform program")
    )]
}

pub fn print_check_output(config: &SiteConfig, programs: usize) {
    for line in format_check_output(config, programs) {
        println!("{}", line);
    }
}
