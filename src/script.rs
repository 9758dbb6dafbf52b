//! Script execution.
//!
//! Scripts run from their own directory with the assembled environment
//! layered over the agent's. Output is captured, appended to the agent log
//! file, and the exit code is reported after every run. A non-zero exit is
//! an outcome, not an error; callers decide what a failure means.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};

use crate::environment::EnvironmentMap;
use crate::report::Reporter;

#[derive(Debug)]
pub struct ScriptOutcome {
    pub script: PathBuf,
    pub exit_code: i32,
}

impl ScriptOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub struct ScriptRunner<'a> {
    log_path: PathBuf,
    reporter: &'a dyn Reporter,
}

impl<'a> ScriptRunner<'a> {
    pub fn new(log_path: PathBuf, reporter: &'a dyn Reporter) -> Self {
        Self { log_path, reporter }
    }

    /// Run one script to completion. Returns an error only when the script
    /// could not be started at all.
    pub fn run(&self, script: &Path, env: &EnvironmentMap) -> anyhow::Result<ScriptOutcome> {
        make_executable(script)?;
        let dir = script
            .parent()
            .with_context(|| format!("script {} has no parent directory", script.display()))?;

        info!("running {}", script.display());
        let output = Command::new(script)
            .current_dir(dir)
            .envs(env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("starting {}", script.display()))?;

        let exit_code = output.status.code().unwrap_or(-1);
        self.append_log(script, exit_code, &output.stdout, &output.stderr)?;

        let name = script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let result = self.reporter.publish(
            "script-result",
            serde_json::json!({ "script": name, "exit_code": exit_code }),
        );
        if let Err(e) = result {
            warn!("reporting result of {name} failed: {e:#}");
        }
        self.reporter
            .log(&format!("script {name} exited with code {exit_code}"));
        if let Err(e) = self.reporter.flush_logs() {
            warn!("flushing logs after {name} failed: {e:#}");
        }

        Ok(ScriptOutcome {
            script: script.to_path_buf(),
            exit_code,
        })
    }

    fn append_log(
        &self,
        script: &Path,
        exit_code: i32,
        stdout: &[u8],
        stderr: &[u8],
    ) -> anyhow::Result<()> {
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.log_path)
            .with_context(|| format!("opening log {}", self.log_path.display()))?;
        writeln!(
            file,
            "=== {} {} (exit {exit_code})",
            Utc::now().to_rfc3339(),
            script.display()
        )?;
        file.write_all(stdout)?;
        file.write_all(stderr)?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(unix)]
fn make_executable(script: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = std::fs::metadata(script)
        .with_context(|| format!("inspecting {}", script.display()))?;
    let mut permissions = metadata.permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    std::fs::set_permissions(script, permissions)
        .with_context(|| format!("marking {} executable", script.display()))
}

#[cfg(not(unix))]
fn make_executable(_script: &Path) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::report::testing::MemoryReporter;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        path
    }

    #[test]
    fn runs_script_and_reports_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "ok.sh", "echo hello; exit 0");
        let reporter = MemoryReporter::default();
        let runner = ScriptRunner::new(tmp.path().join("agent.log"), &reporter);

        let outcome = runner.run(&script, &EnvironmentMap::new()).unwrap();
        assert!(outcome.success());

        let results = reporter.events_of("script-result");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["script"], "ok.sh");
        assert_eq!(results[0]["exit_code"], 0);
        // Logs were flushed as part of the run.
        assert!(!reporter.has_buffered_logs());
    }

    #[test]
    fn nonzero_exit_is_an_outcome_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "fail.sh", "exit 3");
        let reporter = MemoryReporter::default();
        let runner = ScriptRunner::new(tmp.path().join("agent.log"), &reporter);

        let outcome = runner.run(&script, &EnvironmentMap::new()).unwrap();
        assert!(!outcome.success());
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(reporter.events_of("script-result")[0]["exit_code"], 3);
    }

    #[test]
    fn script_sees_environment_and_own_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("boot-scripts");
        std::fs::create_dir_all(&nested).unwrap();
        let script = write_script(&nested, "env.sh", "echo \"$GREETING from $PWD\"");
        let mut env = EnvironmentMap::new();
        env.set("GREETING", "hi");

        let reporter = MemoryReporter::default();
        let log_path = tmp.path().join("agent.log");
        let runner = ScriptRunner::new(log_path.clone(), &reporter);
        runner.run(&script, &env).unwrap();

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("hi from"));
        assert!(log.contains("boot-scripts"));
    }

    #[test]
    fn output_is_appended_across_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "say.sh", "echo line");
        let reporter = MemoryReporter::default();
        let log_path = tmp.path().join("agent.log");
        let runner = ScriptRunner::new(log_path.clone(), &reporter);

        runner.run(&script, &EnvironmentMap::new()).unwrap();
        runner.run(&script, &EnvironmentMap::new()).unwrap();

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(log.matches("line").count(), 2);
    }

    #[test]
    fn non_executable_script_is_made_runnable() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "plain.sh", "exit 0");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();

        let reporter = MemoryReporter::default();
        let runner = ScriptRunner::new(tmp.path().join("agent.log"), &reporter);
        let outcome = runner.run(&script, &EnvironmentMap::new()).unwrap();
        assert!(outcome.success());
    }

    #[test]
    fn missing_script_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let reporter = MemoryReporter::default();
        let runner = ScriptRunner::new(tmp.path().join("agent.log"), &reporter);
        assert!(
            runner
                .run(&tmp.path().join("absent.sh"), &EnvironmentMap::new())
                .is_err()
        );
    }
}
