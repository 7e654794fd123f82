//! Create command - pack a directory into a kaarball

use std::path::Path;
use std::sync::Arc;

use console::style;
use kaar_core::{CancelToken, ImageSource, KaarConfig, OfflineSource};
use kaar_registry::OciImageSource;

use super::print_report;
use crate::error::{CliError, Result};
use crate::util::{format_size, short_digest};

pub async fn run(archive: &Path, dir: &Path, config: &KaarConfig, cancel: CancelToken) -> Result<()> {
    let source: Arc<dyn ImageSource> = if config.embed_images {
        Arc::new(OciImageSource::from_docker_config().map_err(|e| CliError::Create {
            message: e.to_string(),
            help: None,
        })?)
    } else {
        Arc::new(OfflineSource)
    };

    println!(
        "{} {} -> {}",
        style("Packing").cyan().bold(),
        dir.display(),
        archive.display()
    );

    let packed = kaar_core::create(dir, archive, config, source, cancel)
        .await
        .map_err(CliError::create)?;

    let size = std::fs::metadata(packed.path())
        .map(|m| format_size(m.len()))
        .unwrap_or_else(|_| "unknown".to_string());
    let manifest_files = packed.files().values().filter(|f| f.is_manifest).count();

    println!(
        "  {} {}",
        style("Created").green().bold(),
        packed.path().display()
    );
    println!("  {} {}", style("Size").dim(), size);
    println!(
        "  {} {} ({} with manifests)",
        style("Files").dim(),
        packed.files().len(),
        manifest_files
    );
    println!("  {} {}", style("Manifests").dim(), packed.manifests().len());

    if !packed.images().is_empty() {
        println!();
        println!("{}:", style("Images").bold());
        for blob in packed.images().values() {
            let references: Vec<&str> = blob.references.iter().map(String::as_str).collect();
            println!(
                "  {} {} {}",
                short_digest(&blob.digest),
                style(format_size(blob.size())).dim(),
                references.join(", ")
            );
        }
    }

    print_report(packed.report(), config.verbose);
    Ok(())
}
