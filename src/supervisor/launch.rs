use super::bootstrap;
use super::SupervisorError;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Package directory that holds `run_worker.py` in some installs; such
/// scripts run from the directory above it.
const PACKAGE_DIR: &str = "horde_worker_regen";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Unix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStrategy {
    /// Native launcher executed as-is (`.cmd` on Windows).
    Direct,
    /// Shell launcher run through bash (`.sh`).
    Shell,
    /// Python entry point run through the bootstrap wrapper.
    Interpreter,
}

impl LaunchStrategy {
    pub fn describe(self) -> &'static str {
        match self {
            LaunchStrategy::Direct => "launcher",
            LaunchStrategy::Shell => "bash",
            LaunchStrategy::Interpreter => "Python",
        }
    }
}

/// Environment variables the plan augments, captured from the parent.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    pub path: Option<OsString>,
    pub pythonpath: Option<OsString>,
}

impl EnvSnapshot {
    pub fn capture() -> Self {
        Self {
            path: std::env::var_os("PATH"),
            pythonpath: std::env::var_os("PYTHONPATH"),
        }
    }
}

/// Bootstrap script written to disk before an interpreter launch.
#[derive(Debug, Clone, PartialEq)]
pub struct WrapperFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Everything needed to spawn the worker, resolved once per start.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub strategy: LaunchStrategy,
    pub script: PathBuf,
    pub program: OsString,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
    pub env: Vec<(OsString, OsString)>,
    pub wrapper: Option<WrapperFile>,
}

pub fn select_strategy(script: &Path, platform: Platform) -> Result<LaunchStrategy, SupervisorError> {
    let ext = script
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match (platform, ext.as_deref()) {
        (Platform::Windows, Some("cmd" | "bat")) => Ok(LaunchStrategy::Direct),
        (Platform::Unix, Some("sh")) => Ok(LaunchStrategy::Shell),
        (_, Some("py")) => Ok(LaunchStrategy::Interpreter),
        _ => Err(SupervisorError::UnsupportedScript(script.to_path_buf())),
    }
}

/// Directory the worker runs in: the script's own directory, or the one
/// above it when the script sits inside the package directory.
pub fn working_dir_for(script: &Path) -> PathBuf {
    let dir = script.parent().unwrap_or_else(|| Path::new("."));
    let in_package = script
        .components()
        .any(|c| matches!(c, Component::Normal(n) if n == PACKAGE_DIR));
    if in_package {
        dir.parent().unwrap_or(dir).to_path_buf()
    } else {
        dir.to_path_buf()
    }
}

fn prepend(entry: &Path, existing: Option<&OsString>) -> Option<OsString> {
    let mut parts = vec![entry.to_path_buf()];
    if let Some(existing) = existing {
        parts.extend(std::env::split_paths(existing));
    }
    std::env::join_paths(parts).ok()
}

/// Extra environment for the worker: the interpreter's directory on `PATH`
/// and an interpreter-local `Lib/site-packages` on `PYTHONPATH`.
pub fn environment_overrides(python: &Path, snapshot: &EnvSnapshot) -> Vec<(OsString, OsString)> {
    let mut env = vec![(OsString::from("PYTHONUNBUFFERED"), OsString::from("1"))];
    let Some(py_dir) = python.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return env;
    };
    if let Some(path) = prepend(py_dir, snapshot.path.as_ref()) {
        env.push((OsString::from("PATH"), path));
    }
    let site_packages = py_dir.join("Lib").join("site-packages");
    if site_packages.exists() {
        if let Some(pp) = prepend(&site_packages, snapshot.pythonpath.as_ref()) {
            env.push((OsString::from("PYTHONPATH"), pp));
        }
    }
    env
}

pub fn plan_launch(
    script: &Path,
    platform: Platform,
    python: &Path,
    snapshot: &EnvSnapshot,
) -> Result<LaunchPlan, SupervisorError> {
    let strategy = select_strategy(script, platform)?;
    let working_dir = working_dir_for(script);
    let env = environment_overrides(python, snapshot);

    let (program, args, wrapper) = match strategy {
        LaunchStrategy::Direct => (script.as_os_str().to_os_string(), Vec::new(), None),
        LaunchStrategy::Shell => (
            OsString::from("bash"),
            vec![script.as_os_str().to_os_string()],
            None,
        ),
        LaunchStrategy::Interpreter => {
            let path = working_dir.join(bootstrap::WRAPPER_FILE_NAME);
            let contents = bootstrap::wrapper_source(script, &working_dir);
            (
                python.as_os_str().to_os_string(),
                vec![OsString::from("-u"), path.as_os_str().to_os_string()],
                Some(WrapperFile { path, contents }),
            )
        }
    };

    Ok(LaunchPlan {
        strategy,
        script: script.to_path_buf(),
        program,
        args,
        working_dir,
        env,
        wrapper,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_by_platform_and_extension() {
        let s = |p: &str, pl| select_strategy(Path::new(p), pl);
        assert_eq!(s("w/horde-bridge.cmd", Platform::Windows).unwrap(), LaunchStrategy::Direct);
        assert_eq!(s("w/horde-bridge.sh", Platform::Unix).unwrap(), LaunchStrategy::Shell);
        assert_eq!(s("w/run_worker.py", Platform::Unix).unwrap(), LaunchStrategy::Interpreter);
        assert_eq!(s("w/run_worker.py", Platform::Windows).unwrap(), LaunchStrategy::Interpreter);
        assert!(s("w/horde-bridge.sh", Platform::Windows).is_err());
        assert!(s("w/horde-bridge", Platform::Unix).is_err());
    }

    #[test]
    fn package_scripts_run_from_parent_dir() {
        assert_eq!(
            working_dir_for(Path::new("/w/horde_worker_regen/run_worker.py")),
            PathBuf::from("/w")
        );
        assert_eq!(
            working_dir_for(Path::new("/w/run_worker.py")),
            PathBuf::from("/w")
        );
        assert_eq!(
            working_dir_for(Path::new("/w/horde-bridge.sh")),
            PathBuf::from("/w")
        );
    }

    #[test]
    fn shell_plan_uses_bash() {
        let plan = plan_launch(
            Path::new("/w/horde-bridge.sh"),
            Platform::Unix,
            Path::new("python3"),
            &EnvSnapshot::default(),
        )
        .unwrap();
        assert_eq!(plan.program, OsString::from("bash"));
        assert_eq!(plan.args, vec![OsString::from("/w/horde-bridge.sh")]);
        assert!(plan.wrapper.is_none());
    }

    #[test]
    fn interpreter_plan_writes_wrapper_in_working_dir() {
        let plan = plan_launch(
            Path::new("/w/horde_worker_regen/run_worker.py"),
            Platform::Unix,
            Path::new("python3"),
            &EnvSnapshot::default(),
        )
        .unwrap();
        let wrapper = plan.wrapper.expect("wrapper");
        assert_eq!(wrapper.path, PathBuf::from("/w").join(bootstrap::WRAPPER_FILE_NAME));
        assert_eq!(plan.args[0], OsString::from("-u"));
        assert_eq!(plan.args[1], wrapper.path.as_os_str());
        assert!(wrapper.contents.contains("run_worker.py"));
    }

    #[cfg(unix)]
    #[test]
    fn interpreter_dir_is_prepended_to_path() {
        let snapshot = EnvSnapshot {
            path: Some(OsString::from("/usr/bin:/bin")),
            pythonpath: None,
        };
        let env = environment_overrides(Path::new("/opt/py/bin/python3"), &snapshot);
        let path = env
            .iter()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.clone())
            .expect("PATH override");
        assert_eq!(path, OsString::from("/opt/py/bin:/usr/bin:/bin"));
    }

    #[test]
    fn bare_interpreter_name_leaves_path_alone() {
        let env = environment_overrides(Path::new("python3"), &EnvSnapshot::default());
        assert!(env.iter().all(|(k, _)| k != "PATH"));
        assert!(env.iter().any(|(k, _)| k == "PYTHONUNBUFFERED"));
    }
}
