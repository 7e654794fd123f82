//! List command - show a kaarball's index without extracting

use std::path::Path;

use console::style;
use kaar_core::KaarConfig;

use crate::error::{CliError, Result};

pub fn run(archive: &Path, config: &KaarConfig) -> Result<()> {
    let index = kaar_core::list(archive).map_err(CliError::list)?;
    if config.verbose {
        kaar_core::verify(archive).map_err(CliError::list)?;
    }

    println!("{} {}", style("Kaarball").cyan().bold(), archive.display());
    if !index.version.is_empty() {
        println!("  {} {}", style("Created by").dim(), index.version);
    }
    println!();
    print!("{}", index);

    let unresolved = index.unresolved();
    if !unresolved.is_empty() {
        println!();
        println!(
            "{} {} image(s) not embedded",
            style("Warning").yellow().bold(),
            unresolved.len()
        );
        for reference in unresolved {
            println!("  {}", reference);
        }
    }
    Ok(())
}
