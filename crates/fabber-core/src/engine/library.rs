//! Engine library discovery.
//!
//! The engine ships as a core shared library plus optional model-group
//! libraries, one per family of forward models:
//!
//! ```text
//! <bin dir>/
//! ├── libfabbercore_shared.so      # core engine
//! └── ...
//! <model dir>/
//! ├── libfabber_models_asl.so      # model group "asl"
//! └── libfabber_models_dce.so      # model group "dce"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variable naming the core library.
pub const CORE_LIB_ENV: &str = "FABBER_CORE_LIB";
/// Environment variable listing model-group library directories.
pub const MODEL_PATH_ENV: &str = "FABBER_MODEL_PATH";

const CORE_LIB_STEM: &str = "fabbercore_shared";
const MODEL_LIB_MARKER: &str = "fabber_models_";

/// Model group name for a library file name.
///
/// `libfabber_models_asl.so` is group `asl`. Names not following that
/// pattern are used as-is. Always lower case.
pub fn model_group_name(lib: &str) -> String {
    let file = Path::new(lib)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| lib.to_string());
    let lower = file.to_lowercase();
    if let Some(pos) = lower.find(MODEL_LIB_MARKER) {
        let rest = &lower[pos + MODEL_LIB_MARKER.len()..];
        if let Some(dot) = rest.rfind('.')
            && dot > 0
        {
            return rest[..dot].to_string();
        }
    }
    lib.to_lowercase()
}

/// Platform file name of the core library.
fn core_lib_file_name() -> String {
    format!(
        "{}{}{}",
        std::env::consts::DLL_PREFIX,
        CORE_LIB_STEM,
        std::env::consts::DLL_SUFFIX
    )
}

/// Locates engine libraries on disk.
#[derive(Debug, Clone, Default)]
pub struct LibraryLocator {
    /// Explicit core library path.
    pub core_lib: Option<PathBuf>,
    /// Directories searched for model-group libraries.
    pub model_dirs: Vec<PathBuf>,
}

impl LibraryLocator {
    /// Locator configured from `FABBER_CORE_LIB` and `FABBER_MODEL_PATH`.
    pub fn from_env() -> Self {
        let core_lib = std::env::var_os(CORE_LIB_ENV).map(PathBuf::from);
        let model_dirs = std::env::var_os(MODEL_PATH_ENV)
            .map(|paths| std::env::split_paths(&paths).collect())
            .unwrap_or_default();
        Self {
            core_lib,
            model_dirs,
        }
    }

    pub fn with_core_lib(mut self, path: impl Into<PathBuf>) -> Self {
        self.core_lib = Some(path.into());
        self
    }

    pub fn with_model_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.model_dirs.push(dir.into());
        self
    }

    /// Find the core library.
    ///
    /// Looks in the following order:
    /// 1. The explicitly configured path
    /// 2. Same directory as the current executable
    pub fn core_lib(&self) -> Result<PathBuf> {
        if let Some(path) = &self.core_lib {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(Error::Config(format!(
                "engine core library '{}' does not exist",
                path.display()
            )));
        }

        if let Ok(exe_path) = std::env::current_exe()
            && let Some(exe_dir) = exe_path.parent()
        {
            let path = exe_dir.join(core_lib_file_name());
            if path.exists() {
                return Ok(path);
            }
        }

        Err(Error::Config(format!(
            "could not find {}. Set {} or place it next to the executable.",
            core_lib_file_name(),
            CORE_LIB_ENV
        )))
    }

    /// All model-group libraries in the configured directories, sorted.
    pub fn model_libs(&self) -> Vec<PathBuf> {
        let mut libs = Vec::new();
        for dir in &self.model_dirs {
            let Ok(entries) = fs::read_dir(dir) else {
                tracing::debug!("Skipping unreadable model directory {}", dir.display());
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let is_model_lib = path
                    .file_name()
                    .is_some_and(|f| f.to_string_lossy().to_lowercase().contains(MODEL_LIB_MARKER));
                if path.is_file() && is_model_lib {
                    libs.push(path);
                }
            }
        }
        libs.sort();
        libs
    }

    /// Library providing a model group, matched case-insensitively.
    pub fn model_group_lib(&self, group: &str) -> Option<PathBuf> {
        let group = group.to_lowercase();
        self.model_libs()
            .into_iter()
            .find(|lib| model_group_name(&lib.to_string_lossy()) == group)
    }

    /// Names of every available model group.
    pub fn model_groups(&self) -> Vec<String> {
        self.model_libs()
            .iter()
            .map(|lib| model_group_name(&lib.to_string_lossy()))
            .collect()
    }
}
