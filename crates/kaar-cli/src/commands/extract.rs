//! Extract command - restore a kaarball into a directory

use std::path::Path;

use console::style;
use kaar_core::{CancelToken, DirectorySink, ImageSink, KaarConfig, NullSink};

use super::print_report;
use crate::error::{CliError, Result};

pub async fn run(
    archive: &Path,
    dir: &Path,
    image_dir: Option<&Path>,
    config: &KaarConfig,
    cancel: CancelToken,
) -> Result<()> {
    let directory_sink;
    let sink: &dyn ImageSink = match image_dir {
        Some(path) => {
            directory_sink = DirectorySink::new(kaar_core::resolve_path(path));
            &directory_sink
        }
        None => &NullSink,
    };

    println!(
        "{} {} -> {}",
        style("Extracting").cyan().bold(),
        archive.display(),
        dir.display()
    );

    let extracted = kaar_core::extract(archive, dir, config, sink, cancel)
        .await
        .map_err(CliError::extract)?;

    println!(
        "  {} {} file(s), {} manifest(s)",
        style("Restored").green().bold(),
        extracted.files().len(),
        extracted.manifests().len()
    );
    match image_dir {
        Some(path) => println!(
            "  {} {} image(s) to {}",
            style("Images").dim(),
            extracted.images().len(),
            path.display()
        ),
        None if !extracted.images().is_empty() => println!(
            "  {} {} embedded image(s) not loaded (use --image-dir)",
            style("Images").dim(),
            extracted.images().len()
        ),
        None => {}
    }

    print_report(extracted.report(), config.verbose);
    Ok(())
}
