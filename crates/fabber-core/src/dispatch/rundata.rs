//! Deriving engine run options from the host's options.

use std::collections::BTreeMap;

use crate::engine::LibraryLocator;
use crate::error::{Error, Result};
use crate::options::{
    DATA, LOAD_MODELS, METHOD, MODEL, MODEL_GROUP, NOISE, OUTPUT_RENAME, OptionValue, ROI, RunOptions,
};

/// Options ready for dispatch, plus the keys the orchestrator consumes itself.
#[derive(Debug, Clone, PartialEq)]
pub struct RunData {
    /// Options forwarded to every worker.
    pub options: RunOptions,
    /// Main data item names. Several names are stacked into one 4-D volume.
    pub data_names: Vec<String>,
    /// Mask item name; `None` processes every voxel.
    pub roi: Option<String>,
    /// Engine output name to host display name.
    pub rename: BTreeMap<String, String>,
}

impl RunData {
    /// Derive run data from the host's options. The caller's options are
    /// left untouched.
    ///
    /// Missing `model`, `method` and `noise` get defaults that run the
    /// generic polynomial model. A `model-group` is resolved to its library
    /// through `locator` and passed on as `loadmodels`.
    pub fn prepare(options: &RunOptions, locator: &LibraryLocator) -> Result<Self> {
        let mut options = options.clone();

        if !options.contains_key(MODEL) {
            options.insert(MODEL, "poly");
            options.insert("degree", 2i64);
        }
        if !options.contains_key(METHOD) {
            options.insert(METHOD, "vb");
        }
        if !options.contains_key(NOISE) {
            options.insert(NOISE, "white");
        }

        if let Some(group) = options.remove(MODEL_GROUP) {
            let group = group.to_string();
            if !group.is_empty() {
                match locator.model_group_lib(&group) {
                    Some(lib) => options.insert(LOAD_MODELS, lib.to_string_lossy().into_owned()),
                    None => tracing::warn!("Model group '{}' not found, using built-in models", group),
                }
            }
        }

        let rename = match options.remove(OUTPUT_RENAME) {
            None => BTreeMap::new(),
            Some(OptionValue::Mapping(map)) => map,
            Some(other) => {
                return Err(Error::Config(format!(
                    "'{}' must be a mapping, got '{}'",
                    OUTPUT_RENAME, other
                )));
            }
        };

        let data_names = options
            .remove(DATA)
            .map(|value| split_names(&value.to_string()))
            .unwrap_or_default();
        let roi = options
            .remove(ROI)
            .map(|value| value.to_string())
            .filter(|name| !name.is_empty());

        Ok(Self {
            options,
            data_names,
            roi,
            rename,
        })
    }
}

/// Split a list of item names on whitespace and commas.
fn split_names(text: &str) -> Vec<String> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}
