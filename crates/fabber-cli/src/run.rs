//! Run command implementation for the Fabber CLI.
//!
//! Loads volumes into an in-memory store, runs the dispatched fit and writes
//! each output volume to the output directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, bail};
use fabber_core::options::{DATA, OUTPUT_RENAME, ROI};
use fabber_core::{
    DispatchConfig, FabberProcess, LibraryLocator, LogPolicy, MemoryStore, NativeEngineFactory, OptionValue,
    ProcessCallback, ProcessStatus, RunOptions,
};

use crate::volume_io::{read_options, read_volume, write_volume};

/// Store name of the mask item.
const MASK_ITEM: &str = "mask";

/// Everything the `run` subcommand was given.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub data: Vec<PathBuf>,
    pub data_names: Vec<String>,
    pub mask: Option<PathBuf>,
    pub options: Option<PathBuf>,
    pub assignments: Vec<String>,
    pub renames: Vec<String>,
    pub core_lib: Option<PathBuf>,
    pub model_path: Vec<PathBuf>,
    pub threads: usize,
    pub log_policy: LogPolicy,
    pub output: PathBuf,
}

/// Parse a `--log-policy` value.
pub fn parse_log_policy(s: &str) -> Result<LogPolicy, String> {
    match s {
        "first" => Ok(LogPolicy::First),
        "concatenate" => Ok(LogPolicy::Concatenate),
        other => Err(format!("unknown log policy '{}' (expected first or concatenate)", other)),
    }
}

/// Reports progress in 10% steps.
#[derive(Default)]
struct ProgressPrinter {
    last_step: AtomicU64,
}

impl ProcessCallback for ProgressPrinter {
    fn on_progress(&self, fraction: f64) {
        let step = (fraction * 10.0).floor() as u64;
        if step > self.last_step.fetch_max(step, Ordering::Relaxed) {
            tracing::info!("{:.0}% complete", fraction * 100.0);
        }
    }

    fn on_worker_finished(&self, worker_id: usize, success: bool) {
        if !success {
            tracing::warn!("Worker {} failed", worker_id);
        }
    }

    fn on_finished(&self, status: ProcessStatus, _log: &str) {
        tracing::info!("Run {}", status);
    }
}

/// Item name for a data file: the explicit name, or the file stem.
fn item_name(path: &Path, explicit: Option<&String>) -> anyhow::Result<String> {
    if let Some(name) = explicit {
        return Ok(name.clone());
    }
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .with_context(|| format!("Cannot derive a data name from {}", path.display()))
}

/// Build run options: file first, then `key=value` overrides, then renames.
fn build_options(args: &RunArgs, data_names: &[String]) -> anyhow::Result<RunOptions> {
    let mut options = match &args.options {
        Some(path) => read_options(path)?,
        None => RunOptions::new(),
    };
    for assignment in &args.assignments {
        let (key, value) = RunOptions::parse_assignment(assignment)?;
        options.insert(key, value);
    }

    if !args.renames.is_empty() {
        let mut rename = match options.remove(OUTPUT_RENAME) {
            Some(OptionValue::Mapping(map)) => map,
            _ => BTreeMap::new(),
        };
        for pair in &args.renames {
            let Some((key, name)) = pair.split_once('=') else {
                bail!("Invalid rename '{}', expected key=name", pair);
            };
            rename.insert(key.trim().to_string(), name.trim().to_string());
        }
        options.insert(OUTPUT_RENAME, OptionValue::Mapping(rename));
    }

    options.insert(DATA, data_names.join(" "));
    if args.mask.is_some() {
        options.insert(ROI, MASK_ITEM);
    }
    Ok(options)
}

/// Execute a run.
pub fn execute(args: &RunArgs) -> anyhow::Result<()> {
    let start = Instant::now();

    if args.data.is_empty() {
        bail!("At least one --data file is required");
    }

    let mut store = MemoryStore::new();
    let mut data_names = Vec::with_capacity(args.data.len());
    for (idx, path) in args.data.iter().enumerate() {
        let name = item_name(path, args.data_names.get(idx))?;
        tracing::debug!("Loading {} as '{}'", path.display(), name);
        store.insert(name.clone(), read_volume(path)?);
        data_names.push(name);
    }
    if let Some(mask) = &args.mask {
        store.insert(MASK_ITEM, read_volume(mask)?);
    }

    let options = build_options(args, &data_names)?;

    let mut locator = LibraryLocator::from_env();
    if let Some(core_lib) = &args.core_lib {
        locator = locator.with_core_lib(core_lib);
    }
    for dir in &args.model_path {
        locator = locator.with_model_dir(dir);
    }
    let factory = NativeEngineFactory::new(locator.core_lib()?);
    tracing::debug!("Using engine library {}", factory.core_lib().display());

    let config = DispatchConfig::default()
        .with_threads(args.threads)
        .with_log_policy(args.log_policy);
    let mut process = FabberProcess::new(store, Arc::new(factory))
        .with_config(config)
        .with_locator(locator);
    process.set_callback(ProgressPrinter::default());

    process.run(&options)?;
    let status = process.wait();

    if !process.log().is_empty() {
        println!("{}", process.log());
    }

    if status != ProcessStatus::Succeeded {
        match process.error() {
            Some(e) => bail!("Run failed: {}", e),
            None => bail!("Run failed"),
        }
    }

    fs::create_dir_all(&args.output)
        .with_context(|| format!("Failed to create {}", args.output.display()))?;
    for name in process.output_data_items() {
        let Some(volume) = process.store().get(name) else {
            continue;
        };
        let path = args.output.join(format!("{}.json", name));
        write_volume(&path, volume)?;
        tracing::debug!("Wrote {}", path.display());
    }

    println!(
        "Completed: {} outputs written to {} in {:.2}s",
        process.output_data_items().len(),
        args.output.display(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}
