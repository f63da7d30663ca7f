use std::env;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::{info, warn};

#[cfg(all(unix, not(target_os = "macos")))]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(target_os = "macos")]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Directories searched for the ONNX Runtime and CUDA shared libraries.
///
/// Order: `<exe_dir>/` (Windows only), `<exe_dir>/lib/`, `<exe_dir>/../lib/`,
/// `<cwd>/lib/`, then `LD_LIBRARY_PATH` entries and the system lib dirs on Unix.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            push(exe_dir.to_path_buf());
            push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        if let Some(paths) = env::var_os("LD_LIBRARY_PATH") {
            for dir in env::split_paths(&paths) {
                if !dir.as_os_str().is_empty() {
                    push(dir);
                }
            }
        }
        push(PathBuf::from("/usr/local/lib"));
        push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Resolve the ONNX Runtime library: an existing `ORT_DYLIB_PATH` wins, then
/// the candidate directories.
fn resolve_ort_dylib(explicit: Option<PathBuf>, dirs: &[PathBuf]) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Some(path);
        }
    }
    find_ort_dylib_in_dirs(dirs)
}

/// Path of the ONNX Runtime shared library, or `None` when it cannot be found.
pub fn onnxruntime_library() -> Option<PathBuf> {
    let explicit = env::var_os("ORT_DYLIB_PATH").map(PathBuf::from);
    resolve_ort_dylib(explicit, &candidate_lib_dirs())
}

static ORT_INIT: OnceLock<Result<PathBuf, String>> = OnceLock::new();

/// Load ONNX Runtime through `ort::init_from` once per process.
///
/// A library that is missing, is not a shared object, or has an incompatible
/// version yields `Err` here instead of a panic on the first session build.
/// The outcome is remembered for the life of the process.
pub fn init_onnxruntime() -> Result<PathBuf, String> {
    ORT_INIT
        .get_or_init(|| {
            let path = onnxruntime_library().ok_or_else(|| {
                "ONNX Runtime shared library not found (set ORT_DYLIB_PATH)".to_string()
            })?;

            match ort::init_from(&path) {
                Ok(builder) => {
                    builder.commit();
                    info!(path = %path.display(), "ONNX Runtime initialized");
                    Ok(path)
                }
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "Failed to load ONNX Runtime");
                    Err(format!(
                        "failed to load ONNX Runtime from {}: {error}",
                        path.display()
                    ))
                }
            }
        })
        .clone()
}

/// Load-priority tier for CUDA runtime libraries, `None` for anything that
/// must not be preloaded.
///
///   0 — CUDA runtime (cudart, cublas, cublasLt, cufft, curand)
///   1 — cuDNN
#[cfg(unix)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    const CUDA_RUNTIME: [&str; 5] = [
        "libcudart",
        "libcublaslt",
        "libcublas",
        "libcufft",
        "libcurand",
    ];
    if CUDA_RUNTIME.iter().any(|prefix| name.starts_with(prefix)) {
        Some(0)
    } else if name.starts_with("libcudnn") {
        Some(1)
    } else {
        None
    }
}

#[cfg(windows)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if name.starts_with("cudart64_") || name.starts_with("cublas") {
        Some(0)
    } else if name.starts_with("cudnn64_") {
        Some(1)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// Collect preloadable libraries from `dirs`, ordered CUDA runtime before cuDNN.
/// The first directory containing a given file name wins.
fn preload_plan(dirs: &[PathBuf]) -> Vec<PathBuf> {
    use std::collections::HashSet;

    let mut seen_names: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();

            if !is_candidate_lib(&name, &path) {
                continue;
            }
            let Some(priority) = load_priority(&name) else {
                continue;
            };
            if seen_names.insert(name.clone()) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

#[cfg(unix)]
unsafe fn load_library(path: &Path) {
    if let Ok(lib) =
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    {
        std::mem::forget(lib);
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) {
    if let Ok(lib) = libloading::Library::new(path) {
        std::mem::forget(lib);
    }
}

/// Export `ORT_DYLIB_PATH` and preload CUDA libraries before ONNX Runtime is
/// first touched. Call at the start of `main()`.
pub fn setup_runtime_libs() {
    let dirs = candidate_lib_dirs();

    if env::var_os("ORT_DYLIB_PATH").is_none() {
        if let Some(path) = find_ort_dylib_in_dirs(&dirs) {
            env::set_var("ORT_DYLIB_PATH", &path);
        }

        #[cfg(windows)]
        if let Ok(joined) = env::join_paths(
            dirs.iter()
                .filter(|dir| dir.is_dir())
                .cloned()
                .chain(env::var_os("PATH").iter().flat_map(env::split_paths)),
        ) {
            env::set_var("PATH", joined);
        }
    }

    for lib_path in preload_plan(&dirs) {
        unsafe { load_library(&lib_path) };
    }
}

/// Log which ONNX Runtime library will be used. Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    match onnxruntime_library() {
        Some(path) => info!(path = %path.display(), "ONNX Runtime library found"),
        None => warn!(
            "ONNX Runtime library not found; super-resolution will use the Lanczos fallback"
        ),
    }
}
