//! Native engine bound through the core library's C entry points.
//!
//! # ABI
//!
//! ```text
//! void *fabber_new(char *err);
//! int   fabber_load_models(void *fab, const char *lib, char *err);
//! int   fabber_set_extent(void *fab, unsigned nx, unsigned ny, unsigned nz, const int *mask, char *err);
//! int   fabber_set_opt(void *fab, const char *key, const char *value, char *err);
//! int   fabber_set_data(void *fab, const char *name, unsigned per_voxel, const float *data, char *err);
//! int   fabber_get_model_params(void *fab, unsigned len, char *out, char *err);
//! int   fabber_get_data_size(void *fab, const char *name, char *err);
//! int   fabber_get_data(void *fab, const char *name, float *out, char *err);
//! int   fabber_dorun(void *fab, unsigned log_len, char *log, char *err, void (*progress)(int, int));
//! void  fabber_destroy(void *fab);
//! ```
//!
//! Negative return codes are failures with a message in `err`. Arrays are
//! column-major: x varies fastest and the per-voxel axis slowest.

use std::cell::Cell;
use std::ffi::{CStr, CString, c_char, c_int, c_uint, c_void};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use ndarray::{ArrayD, IxDyn, ShapeBuilder};

use crate::error::{Error, Result};
use crate::options::{DATA, LOAD_MODELS, OptionValue, RunOptions, WORKING_DIR};

use super::{DataBundle, Engine, EngineFactory, EngineSelection, RunResult};

const ERR_BUF_LEN: usize = 255;
const LOG_BUF_LEN: usize = 1 << 20;
const PARAM_BUF_LEN: usize = 4096;

type NewFn = unsafe extern "C" fn(*mut c_char) -> *mut c_void;
type LoadModelsFn = unsafe extern "C" fn(*mut c_void, *const c_char, *mut c_char) -> c_int;
type SetExtentFn =
    unsafe extern "C" fn(*mut c_void, c_uint, c_uint, c_uint, *const c_int, *mut c_char) -> c_int;
type SetOptFn = unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char, *mut c_char) -> c_int;
type SetDataFn =
    unsafe extern "C" fn(*mut c_void, *const c_char, c_uint, *const f32, *mut c_char) -> c_int;
type GetModelParamsFn = unsafe extern "C" fn(*mut c_void, c_uint, *mut c_char, *mut c_char) -> c_int;
type GetDataSizeFn = unsafe extern "C" fn(*mut c_void, *const c_char, *mut c_char) -> c_int;
type GetDataFn = unsafe extern "C" fn(*mut c_void, *const c_char, *mut f32, *mut c_char) -> c_int;
type ProgressFn = extern "C" fn(c_int, c_int);
type DoRunFn =
    unsafe extern "C" fn(*mut c_void, c_uint, *mut c_char, *mut c_char, Option<ProgressFn>) -> c_int;
type DestroyFn = unsafe extern "C" fn(*mut c_void);

// The C progress callback carries no user pointer. Each worker runs the
// engine on its own thread, so the active callback lives in a thread-local.
thread_local! {
    static PROGRESS: Cell<Option<*mut (dyn FnMut(usize, usize) + 'static)>> = const { Cell::new(None) };
}

extern "C" fn progress_trampoline(done: c_int, total: c_int) {
    PROGRESS.with(|slot| {
        if let Some(callback) = slot.get() {
            // SAFETY: set by `ProgressScope`, which outlives the engine call.
            unsafe { (*callback)(done.max(0) as usize, total.max(0) as usize) }
        }
    });
}

/// Installs a progress callback for the current thread until dropped.
struct ProgressScope<'a> {
    _borrow: PhantomData<&'a mut ()>,
}

impl<'a> ProgressScope<'a> {
    fn install(callback: &'a mut dyn FnMut(usize, usize)) -> Self {
        let ptr = callback as *mut (dyn FnMut(usize, usize) + 'a);
        // SAFETY: the lifetime is erased only while the scope is alive; Drop
        // clears the slot before the borrow ends.
        let ptr: *mut (dyn FnMut(usize, usize) + 'static) = unsafe { std::mem::transmute(ptr) };
        PROGRESS.with(|slot| slot.set(Some(ptr)));
        Self {
            _borrow: PhantomData,
        }
    }
}

impl Drop for ProgressScope<'_> {
    fn drop(&mut self) {
        PROGRESS.with(|slot| slot.set(None));
    }
}

fn c_string(text: &str) -> Result<CString> {
    CString::new(text).map_err(|_| Error::Config(format!("'{}' contains a NUL byte", text)))
}

fn buf_to_string(buf: &[u8]) -> String {
    match CStr::from_bytes_until_nul(buf) {
        Ok(s) => s.to_string_lossy().into_owned(),
        Err(_) => String::from_utf8_lossy(buf).into_owned(),
    }
}

fn check(code: c_int, err: &[u8], what: &str) -> Result<()> {
    if code < 0 {
        return Err(Error::engine(format!("{}: {}", what, buf_to_string(err)), ""));
    }
    Ok(())
}

/// Flatten to column-major order.
fn to_fortran(array: &ArrayD<f32>) -> Vec<f32> {
    array.t().iter().copied().collect()
}

/// Rebuild a row-major array from column-major engine output. A single
/// value per voxel gives a 3-D array, anything more adds a fourth axis.
fn from_fortran(values: Vec<f32>, extent: [usize; 3], per_voxel: usize) -> Result<ArrayD<f32>> {
    let shape: Vec<usize> = if per_voxel == 1 {
        extent.to_vec()
    } else {
        extent.iter().copied().chain([per_voxel]).collect()
    };
    let array = ArrayD::from_shape_vec(IxDyn(&shape).f(), values).map_err(|e| Error::Shape(e.to_string()))?;
    Ok(array.as_standard_layout().into_owned())
}

/// Output names implied by the `save-*` options.
fn output_names(options: &RunOptions, params: &[String]) -> Vec<String> {
    let mut names = Vec::new();
    for (flag, prefix) in [("save-mean", "mean"), ("save-std", "std"), ("save-zstat", "zstat")] {
        if options.contains_key(flag) {
            names.extend(params.iter().map(|p| format!("{}_{}", prefix, p)));
        }
    }
    for (flag, name) in [
        ("save-model-fit", "modelfit"),
        ("save-residuals", "residuals"),
        ("save-free-energy", "freeEnergy"),
        ("save-noise-mean", "noise_means"),
        ("save-noise-std", "noise_stdevs"),
    ] {
        if options.contains_key(flag) {
            names.push(name.to_string());
        }
    }
    names
}

/// Engine instance backed by the core shared library.
///
/// Owns its library handle and engine instance; both are released on drop.
pub struct NativeEngine {
    handle: *mut c_void,
    set_extent: SetExtentFn,
    set_opt: SetOptFn,
    set_data: SetDataFn,
    get_model_params: GetModelParamsFn,
    get_data_size: GetDataSizeFn,
    get_data: GetDataFn,
    dorun: DoRunFn,
    destroy: DestroyFn,
    /// Keeps the function pointers above valid.
    _library: Library,
}

fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T> {
    // SAFETY: the caller names the symbol with its declared signature.
    let sym: Symbol<T> = unsafe { library.get(name.as_bytes()) }.map_err(|e| {
        Error::engine(format!("Failed to get symbol {}: {}", name, e), "")
    })?;
    Ok(*sym)
}

impl NativeEngine {
    /// Load the core library, create an engine and load model-group libraries.
    pub fn load(core_lib: &Path, model_libs: &[PathBuf]) -> Result<Self> {
        // SAFETY: loading runs the library's initialisers; the core library is trusted.
        let library = unsafe { Library::new(core_lib) }?;

        let new: NewFn = symbol(&library, "fabber_new")?;
        let load_models: LoadModelsFn = symbol(&library, "fabber_load_models")?;
        let set_extent = symbol(&library, "fabber_set_extent")?;
        let set_opt = symbol(&library, "fabber_set_opt")?;
        let set_data = symbol(&library, "fabber_set_data")?;
        let get_model_params = symbol(&library, "fabber_get_model_params")?;
        let get_data_size = symbol(&library, "fabber_get_data_size")?;
        let get_data = symbol(&library, "fabber_get_data")?;
        let dorun = symbol(&library, "fabber_dorun")?;
        let destroy = symbol(&library, "fabber_destroy")?;

        let mut err = vec![0u8; ERR_BUF_LEN];
        // SAFETY: err is a writable buffer of ERR_BUF_LEN bytes.
        let handle = unsafe { new(err.as_mut_ptr().cast()) };
        if handle.is_null() {
            return Err(Error::engine(
                format!("Failed to create engine: {}", buf_to_string(&err)),
                "",
            ));
        }

        // From here on Drop releases the handle.
        let engine = Self {
            handle,
            set_extent,
            set_opt,
            set_data,
            get_model_params,
            get_data_size,
            get_data,
            dorun,
            destroy,
            _library: library,
        };

        for lib in model_libs {
            let path = c_string(&lib.to_string_lossy())?;
            // SAFETY: handle is live, path is NUL-terminated.
            let code = unsafe { load_models(engine.handle, path.as_ptr(), err.as_mut_ptr().cast()) };
            check(code, &err, &format!("Failed to load model library {}", lib.display()))?;
        }

        Ok(engine)
    }

    fn set_array(&self, name: &str, array: &ArrayD<f32>, err: &mut [u8]) -> Result<()> {
        let per_voxel = if array.ndim() == 4 { array.shape()[3] } else { 1 };
        let values = to_fortran(array);
        let key = c_string(name)?;
        // SAFETY: values holds nvoxels * per_voxel floats.
        let code = unsafe {
            (self.set_data)(
                self.handle,
                key.as_ptr(),
                per_voxel as c_uint,
                values.as_ptr(),
                err.as_mut_ptr().cast(),
            )
        };
        check(code, err, &format!("Failed to set data '{}'", name))
    }

    fn model_params(&self, err: &mut [u8]) -> Result<Vec<String>> {
        let mut buf = vec![0u8; PARAM_BUF_LEN];
        // SAFETY: buf is PARAM_BUF_LEN bytes.
        let code = unsafe {
            (self.get_model_params)(
                self.handle,
                PARAM_BUF_LEN as c_uint,
                buf.as_mut_ptr().cast(),
                err.as_mut_ptr().cast(),
            )
        };
        check(code, err, "Failed to get model parameters")?;
        Ok(buf_to_string(&buf)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    fn fetch(&self, name: &str, extent: [usize; 3], err: &mut [u8]) -> Result<Option<ArrayD<f32>>> {
        let key = c_string(name)?;
        // SAFETY: handle is live, key is NUL-terminated.
        let per_voxel = unsafe { (self.get_data_size)(self.handle, key.as_ptr(), err.as_mut_ptr().cast()) };
        if per_voxel < 0 {
            tracing::debug!("Engine produced no output '{}'", name);
            return Ok(None);
        }
        let per_voxel = per_voxel as usize;
        let nvoxels: usize = extent.iter().product();
        let mut values = vec![0f32; nvoxels * per_voxel];
        // SAFETY: values has room for every voxel's per-voxel values.
        let code = unsafe {
            (self.get_data)(self.handle, key.as_ptr(), values.as_mut_ptr(), err.as_mut_ptr().cast())
        };
        check(code, err, &format!("Failed to get output '{}'", name))?;

        from_fortran(values, extent, per_voxel)
            .map(Some)
            .map_err(|e| Error::Shape(format!("output '{}': {}", name, e)))
    }
}

impl Engine for NativeEngine {
    fn run(
        &mut self,
        options: &RunOptions,
        bundle: &DataBundle,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<RunResult> {
        let mut err = vec![0u8; ERR_BUF_LEN];
        let (nx, ny, nz) = bundle.mask.dim();
        let mask: Vec<c_int> = bundle.mask.t().iter().map(|&set| c_int::from(set)).collect();
        // SAFETY: mask holds nx * ny * nz ints.
        let code = unsafe {
            (self.set_extent)(
                self.handle,
                nx as c_uint,
                ny as c_uint,
                nz as c_uint,
                mask.as_ptr(),
                err.as_mut_ptr().cast(),
            )
        };
        check(code, &err, "Failed to set extent")?;

        for (key, value) in options.iter() {
            if key == LOAD_MODELS || key == WORKING_DIR || matches!(value, OptionValue::Mapping(_)) {
                continue;
            }
            let k = c_string(key)?;
            let v = c_string(&value.to_string())?;
            // SAFETY: both strings are NUL-terminated.
            let code =
                unsafe { (self.set_opt)(self.handle, k.as_ptr(), v.as_ptr(), err.as_mut_ptr().cast()) };
            check(code, &err, &format!("Failed to set option '{}'", key))?;
        }

        self.set_array(DATA, &bundle.data, &mut err)?;
        for (name, array) in &bundle.extra {
            self.set_array(name, array, &mut err)?;
        }

        let mut log = vec![0u8; LOG_BUF_LEN];
        let code = {
            let _scope = ProgressScope::install(progress);
            // SAFETY: log and err are writable buffers of the advertised size.
            unsafe {
                (self.dorun)(
                    self.handle,
                    LOG_BUF_LEN as c_uint,
                    log.as_mut_ptr().cast(),
                    err.as_mut_ptr().cast(),
                    Some(progress_trampoline),
                )
            }
        };
        let log = buf_to_string(&log);
        if code < 0 {
            return Err(Error::engine(buf_to_string(&err), log));
        }

        let params = self.model_params(&mut err)?;
        let mut result = RunResult { log, ..RunResult::default() };
        for name in output_names(options, &params) {
            if let Some(array) = self.fetch(&name, [nx, ny, nz], &mut err)? {
                result.data.insert(name, array);
            }
        }
        Ok(result)
    }
}

impl Drop for NativeEngine {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            // SAFETY: handle came from fabber_new and is destroyed exactly once.
            unsafe { (self.destroy)(self.handle) };
            self.handle = std::ptr::null_mut();
        }
    }
}

/// Creates a fresh `NativeEngine` per worker.
#[derive(Debug, Clone)]
pub struct NativeEngineFactory {
    core_lib: PathBuf,
}

impl NativeEngineFactory {
    pub fn new(core_lib: impl Into<PathBuf>) -> Self {
        Self {
            core_lib: core_lib.into(),
        }
    }

    pub fn core_lib(&self) -> &Path {
        &self.core_lib
    }
}

impl EngineFactory for NativeEngineFactory {
    fn create(&self, selection: &EngineSelection) -> Result<Box<dyn Engine>> {
        Ok(Box::new(NativeEngine::load(&self.core_lib, &selection.model_libs)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_names() {
        let mut opts = RunOptions::new();
        opts.insert("save-mean", OptionValue::Flag);
        opts.insert("save-model-fit", OptionValue::Flag);
        let params = vec!["c0".to_string(), "c1".to_string()];
        assert_eq!(output_names(&opts, &params), vec!["mean_c0", "mean_c1", "modelfit"]);
    }

    #[test]
    fn test_fortran_order() {
        let array = ArrayD::from_shape_vec(IxDyn(&[2, 2, 1]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        // x fastest: (0,0), (1,0), (0,1), (1,1)
        assert_eq!(to_fortran(&array), vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_from_fortran_restores_4d() {
        let array = ArrayD::from_shape_fn(IxDyn(&[2, 3, 2, 4]), |ix| {
            (ix[0] * 1000 + ix[1] * 100 + ix[2] * 10 + ix[3]) as f32
        });
        let back = from_fortran(to_fortran(&array), [2, 3, 2], 4).unwrap();
        assert_eq!(back, array);
        assert!(back.is_standard_layout());
        assert_eq!(back[[1, 2, 0, 3]], 1203.0);
    }

    #[test]
    fn test_from_fortran_single_value_is_3d() {
        let back = from_fortran(vec![1.0, 3.0, 2.0, 4.0], [2, 2, 1], 1).unwrap();
        assert_eq!(back.shape(), &[2, 2, 1]);
        assert_eq!(back[[1, 0, 0]], 3.0);
        assert_eq!(back[[0, 1, 0]], 2.0);
        assert!(from_fortran(vec![0.0; 3], [2, 2, 1], 1).is_err());
    }

    #[test]
    fn test_buf_to_string() {
        assert_eq!(buf_to_string(b"hello\0garbage"), "hello");
        assert_eq!(buf_to_string(b"no nul"), "no nul");
    }

    #[test]
    fn test_progress_scope_routes_and_clears() {
        let mut seen = Vec::new();
        {
            let mut cb = |done: usize, total: usize| seen.push((done, total));
            let _scope = ProgressScope::install(&mut cb);
            progress_trampoline(5, 10);
            progress_trampoline(-1, 10);
        }
        // No callback installed: ignored.
        progress_trampoline(1, 1);
        assert_eq!(seen, vec![(5, 10), (0, 10)]);
    }

    #[test]
    fn test_load_missing_library() {
        let result = NativeEngine::load(Path::new("/nonexistent/libfabbercore_shared.so"), &[]);
        assert!(matches!(result, Err(Error::LibraryLoad(_))));
    }
}
