use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};
use tokio::process::Command;
use tokio::runtime::{Builder, Handle};
use uuid::Uuid;

use super::platform::Platform;
use super::types::{ExecutionResult, ScriptHost, ScriptSpec};

/// Registry imports are expected to be quick.
const REGEDIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs external cleanup scripts in their declared host shell.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    platform: Platform,
    timeout: Duration,
}

impl ScriptRunner {
    pub fn new(platform: Platform, timeout: Duration) -> Self {
        ScriptRunner { platform, timeout }
    }

    pub async fn run(&self, spec: &ScriptSpec) -> ExecutionResult {
        if !self.platform.is_windows() {
            return off_platform();
        }

        // Keeps the script file alive until the process exits
        let mut _script_file = None;
        let (program, args, timeout) = match spec.host {
            ScriptHost::PowerShell => {
                let file = match TempScript::write("ps1", &spec.code) {
                    Ok(f) => f,
                    Err(e) => return ExecutionResult::failure(e),
                };
                let args = vec![
                    "-NoProfile".to_string(),
                    "-ExecutionPolicy".to_string(),
                    "Bypass".to_string(),
                    "-File".to_string(),
                    file.path.to_string_lossy().into_owned(),
                ];
                _script_file = Some(file);
                ("powershell.exe", args, self.timeout)
            }
            ScriptHost::Regedit => {
                let file = match TempScript::write("reg", &spec.code) {
                    Ok(f) => f,
                    Err(e) => return ExecutionResult::failure(e),
                };
                let args = vec!["/s".to_string(), file.path.to_string_lossy().into_owned()];
                _script_file = Some(file);
                ("regedit.exe", args, self.timeout.min(REGEDIT_TIMEOUT))
            }
            ScriptHost::Cmd | ScriptHost::Execute => (
                "cmd.exe",
                vec!["/d".to_string(), "/c".to_string(), spec.code.clone()],
                self.timeout,
            ),
        };

        let child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(c) => c,
            Err(e) => {
                error!("Failed to start {}: {}", program, e);
                return ExecutionResult::failure(format!("failed to start {}: {}", program, e));
            }
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let result = ExecutionResult {
                    success: output.status.success(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: output.status.code(),
                };
                info!(
                    "{:?} script finished (exit: {:?})",
                    spec.host, result.exit_code
                );
                result
            }
            Ok(Err(e)) => ExecutionResult::failure(format!("{} failed: {}", program, e)),
            Err(_) => {
                warn!("{:?} script timed out after {:?}", spec.host, timeout);
                ExecutionResult::failure(format!("timed out after {}s", timeout.as_secs()))
            }
        }
    }

    /// Synchronous entry point. Safe from any thread: inside a runtime the
    /// script is driven on a scoped thread with its own runtime.
    pub fn run_blocking(&self, spec: &ScriptSpec) -> ExecutionResult {
        if !self.platform.is_windows() {
            return off_platform();
        }
        if Handle::try_current().is_err() {
            return self.run_on_own_runtime(spec);
        }
        thread::scope(|scope| {
            scope
                .spawn(|| self.run_on_own_runtime(spec))
                .join()
                .unwrap_or_else(|_| ExecutionResult::failure("script thread panicked"))
        })
    }

    fn run_on_own_runtime(&self, spec: &ScriptSpec) -> ExecutionResult {
        match Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt.block_on(self.run(spec)),
            Err(e) => ExecutionResult::failure(format!("failed to build runtime: {}", e)),
        }
    }
}

fn off_platform() -> ExecutionResult {
    ExecutionResult::failure("external scripts only run on Windows")
}

struct TempScript {
    path: PathBuf,
}

impl TempScript {
    fn write(extension: &str, code: &str) -> Result<Self, String> {
        let path = env::temp_dir().join(format!("privacy_eraser_{}.{}", Uuid::new_v4(), extension));
        fs::write(&path, code).map_err(|e| format!("failed to write script file: {}", e))?;
        Ok(TempScript { path })
    }
}

impl Drop for TempScript {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ScriptSpec {
        ScriptSpec {
            host: ScriptHost::Cmd,
            code: "echo hi".into(),
        }
    }

    #[test]
    fn refuses_to_run_off_windows() {
        let runner = ScriptRunner::new(Platform::Linux, Duration::from_secs(5));
        let result = runner.run_blocking(&spec());
        assert!(!result.success);
        assert_eq!(result.exit_code, None);
        assert!(result.stderr.contains("Windows"));
    }

    #[tokio::test]
    async fn async_entry_point_refuses_too() {
        let runner = ScriptRunner::new(Platform::Darwin, Duration::from_secs(5));
        assert!(!runner.run(&spec()).await.success);
    }

    #[tokio::test]
    async fn blocking_entry_point_is_safe_inside_a_runtime() {
        let runner = ScriptRunner::new(Platform::Linux, Duration::from_secs(5));
        let result = runner.run_blocking(&spec());
        assert!(!result.success);
        assert!(result.stderr.contains("Windows"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_entry_point_runs_on_a_worker_thread() {
        // Windows takes the scoped-thread path; elsewhere the platform gate answers first
        let runner = ScriptRunner::new(Platform::current(), Duration::from_secs(5));
        let result = runner.run_blocking(&spec());
        if Platform::current().is_windows() {
            assert!(result.success, "{:?}", result);
            assert!(result.stdout.contains("hi"));
        } else {
            assert!(!result.success);
        }
    }

    #[test]
    fn temp_script_is_removed_on_drop() {
        let file = TempScript::write("ps1", "Write-Host hi").unwrap();
        let path = file.path.clone();
        assert!(path.exists());
        drop(file);
        assert!(!path.exists());
    }
}
