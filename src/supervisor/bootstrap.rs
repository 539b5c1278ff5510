//! Python dependency bootstrap.
//!
//! Before an interpreter launch the critical modules are checked with the
//! configured interpreter and installed through pip when missing. The wrapper
//! script repeats the check-and-install-once step inside the worker's own
//! interpreter.

use std::path::Path;
use tokio::process::Command;

pub const WRAPPER_FILE_NAME: &str = "gui_worker_wrapper.py";

/// `(import name, pip package)` pairs the worker cannot start without.
pub const CRITICAL_MODULES: &[(&str, &str)] = &[
    ("loguru", "loguru"),
    ("yaml", "pyyaml"),
    ("requests", "requests"),
];

/// Everything the worker's image pipeline imports; checked before a start when
/// the dependency check is enabled.
pub const RUNTIME_MODULES: &[(&str, &str)] = &[
    ("loguru", "loguru"),
    ("yaml", "pyyaml"),
    ("requests", "requests"),
    ("tqdm", "tqdm"),
    ("PIL", "pillow"),
    ("numpy", "numpy"),
    ("torch", "torch"),
    ("transformers", "transformers"),
    ("diffusers", "diffusers"),
];

/// Modules the wrapper ensures before handing over to the worker script.
pub const WRAPPER_MODULES: &[(&str, &str)] = &[
    ("loguru", "loguru"),
    ("yaml", "pyyaml"),
    ("requests", "requests"),
    ("tqdm", "tqdm"),
];

const WRAPPER_TEMPLATE: &str = r#"import importlib
import runpy
import subprocess
import sys

REQUIRED = __MODULES__
SCRIPT = __SCRIPT__
WORKER_DIR = __WORKER_DIR__

for module, package in REQUIRED:
    try:
        importlib.import_module(module)
    except ImportError:
        print(f"Installing missing dependency: {package}", flush=True)
        subprocess.check_call([sys.executable, "-m", "pip", "install", package])

sys.path.insert(0, WORKER_DIR)
try:
    runpy.run_path(SCRIPT, run_name="__main__")
except Exception as e:
    print(f"Error running worker script: {e}", flush=True)
    sys.exit(1)
"#;

/// JSON string literals are valid Python string literals.
fn py_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".into())
}

pub fn wrapper_source(script: &Path, worker_dir: &Path) -> String {
    let modules = WRAPPER_MODULES
        .iter()
        .map(|(m, p)| format!("({}, {})", py_str(m), py_str(p)))
        .collect::<Vec<_>>()
        .join(", ");
    WRAPPER_TEMPLATE
        .replace("__MODULES__", &format!("[{modules}]"))
        .replace("__SCRIPT__", &py_str(&script.to_string_lossy()))
        .replace("__WORKER_DIR__", &py_str(&worker_dir.to_string_lossy()))
}

/// Whether `python -c "import <module>"` succeeds.
pub async fn module_available(python: &Path, module: &str) -> bool {
    Command::new(python)
        .arg("-c")
        .arg(format!("import {module}"))
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Run `python -m pip install <package>`; on failure returns the tail of stderr.
pub async fn install_package(python: &Path, package: &str) -> Result<(), String> {
    tracing::info!(package, "installing python dependency");
    let output = Command::new(python)
        .args(["-m", "pip", "install", package])
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| format!("failed to run pip: {e}"))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let detail = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("pip exited with an error")
        .trim()
        .to_string();
    tracing::warn!(package, %detail, "pip install failed");
    Err(detail)
}

/// Import names from `modules` that the interpreter cannot load.
pub async fn missing_modules(
    python: &Path,
    modules: &[(&'static str, &'static str)],
) -> Vec<(&'static str, &'static str)> {
    let mut missing = Vec::new();
    for &(module, package) in modules {
        if !module_available(python, module).await {
            missing.push((module, package));
        }
    }
    missing
}
