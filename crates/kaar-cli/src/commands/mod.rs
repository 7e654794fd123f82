//! CLI commands

pub mod create;
pub mod extract;
pub mod list;

use console::style;
use kaar_core::Report;

/// Print the problem summary, and the full report in verbose mode
pub(crate) fn print_report(report: &Report, verbose: bool) {
    if report.is_clean() && !verbose {
        return;
    }
    if report.is_clean() {
        println!("  {} {}", style("Report").dim(), report.summary());
        return;
    }

    println!("  {} {}", style("Warnings").yellow().bold(), report.summary());
    if verbose {
        for line in report.to_string().lines().skip(1) {
            println!("  {}", line);
        }
    } else {
        println!("  {}", style("Run with --verbose for details").dim());
    }
}
