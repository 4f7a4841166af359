//! Models command: lists the model groups that can be loaded.

use std::path::PathBuf;

use fabber_core::LibraryLocator;

/// Print every model group found in the configured directories.
pub fn execute(model_path: &[PathBuf]) -> anyhow::Result<()> {
    let locator = model_path
        .iter()
        .fold(LibraryLocator::from_env(), |locator, dir| locator.with_model_dir(dir));

    let libs = locator.model_libs();
    if libs.is_empty() {
        println!("No model groups found. Set FABBER_MODEL_PATH or pass --model-path.");
        return Ok(());
    }

    for (group, lib) in locator.model_groups().iter().zip(&libs) {
        println!("{:<16} {}", group.to_uppercase(), lib.display());
    }
    Ok(())
}
