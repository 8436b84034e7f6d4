//! Provisioning executor.
//!
//! Runs Terraform (or Terragrunt, when `terragrunt.hcl` is present in the
//! working directory) through its stages as blocking subprocesses. A non-zero
//! exit is reported as an unsuccessful [`StageOutcome`]; retries are the
//! caller's decision.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use duct::cmd;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{IacError, Result};
use crate::workdir::WorkDir;

/// Presence of this file switches every stage to the Terragrunt wrapper.
pub const WRAPPER_CONFIG_FILE: &str = "terragrunt.hcl";
pub const PLAN_FILE: &str = "tfplan";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Init,
    Plan,
    Apply,
    Destroy,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Plan => "plan",
            Stage::Apply => "apply",
            Stage::Destroy => "destroy",
        }
    }

    fn tool_args(&self) -> Vec<String> {
        let mut args = vec![self.as_str().to_string()];
        match self {
            Stage::Init => {}
            Stage::Plan => args.push(format!("-out={PLAN_FILE}")),
            Stage::Apply | Stage::Destroy => args.push("-auto-approve".to_string()),
        }
        args.push("-input=false".to_string());
        args.push("-no-color".to_string());
        if *self == Stage::Apply {
            args.push(PLAN_FILE.to_string());
        }
        args
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one stage.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage: Stage,
    pub success: bool,
    pub stdout: String,
    /// Only populated when the stage failed.
    pub stderr: String,
    pub duration: Duration,
    /// Flattened `output -json`, apply only.
    pub outputs: BTreeMap<String, String>,
}

impl StageOutcome {
    /// Best single-line-ish diagnostic for a failed stage.
    pub fn diagnostic(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        tail_lines(text, 50)
    }
}

/// Runs provisioning stages inside a prepared working directory.
pub trait IacExecutor: Send + Sync {
    fn run_stage(&self, workdir: &WorkDir, stage: Stage) -> Result<StageOutcome>;
}

/// A fully resolved tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

struct RawOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Executor backed by the real `terraform` / `terragrunt` binaries.
#[derive(Debug, Clone)]
pub struct TerraformExecutor {
    terraform_bin: String,
    terragrunt_bin: String,
    stage_timeout: Option<Duration>,
}

impl Default for TerraformExecutor {
    fn default() -> Self {
        Self {
            terraform_bin: "terraform".to_string(),
            terragrunt_bin: "terragrunt".to_string(),
            stage_timeout: None,
        }
    }
}

impl TerraformExecutor {
    pub fn new(terraform_bin: impl Into<String>, terragrunt_bin: impl Into<String>) -> Self {
        Self {
            terraform_bin: terraform_bin.into(),
            terragrunt_bin: terragrunt_bin.into(),
            stage_timeout: None,
        }
    }

    /// Kill a stage that runs longer than `timeout`.
    pub fn with_stage_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Whether `dir` is run through the wrapper.
    pub fn uses_wrapper(dir: &Path) -> bool {
        dir.join(WRAPPER_CONFIG_FILE).is_file()
    }

    /// Build the invocation for `tool_args` in `dir`.
    pub fn command_for(&self, dir: &Path, tool_args: Vec<String>) -> ToolCommand {
        if Self::uses_wrapper(dir) {
            let mut args = vec![
                "run".to_string(),
                "--non-interactive".to_string(),
                "--".to_string(),
            ];
            args.extend(tool_args);
            ToolCommand {
                program: self.terragrunt_bin.clone(),
                args,
            }
        } else {
            ToolCommand {
                program: self.terraform_bin.clone(),
                args: tool_args,
            }
        }
    }

    pub fn stage_command(&self, dir: &Path, stage: Stage) -> ToolCommand {
        self.command_for(dir, stage.tool_args())
    }

    fn run(&self, workdir: &WorkDir, command: &ToolCommand) -> Result<RawOutput> {
        debug!(command = %command, dir = %workdir.path().display(), "Running provisioning tool");

        let mut expression = cmd(&command.program, &command.args)
            .dir(workdir.path())
            .stdout_capture()
            .stderr_capture()
            .unchecked();
        for (key, value) in workdir.env() {
            expression = expression.env(key, value);
        }

        let handle = expression.start().map_err(|source| IacError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let started = Instant::now();
        loop {
            match handle.try_wait() {
                Ok(Some(output)) => {
                    return Ok(RawOutput {
                        success: output.status.success(),
                        stdout: strip_ansi(&String::from_utf8_lossy(&output.stdout)),
                        stderr: strip_ansi(&String::from_utf8_lossy(&output.stderr)),
                    });
                }
                Ok(None) => {
                    if let Some(timeout) = self.stage_timeout {
                        if started.elapsed() >= timeout {
                            let _ = handle.kill();
                            warn!(command = %command, "Provisioning tool timed out");
                            return Ok(RawOutput {
                                success: false,
                                stdout: String::new(),
                                stderr: format!(
                                    "'{}' timed out after {}s",
                                    command,
                                    timeout.as_secs()
                                ),
                            });
                        }
                    }
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    return Err(IacError::Io(e));
                }
            }
        }
    }
}

impl IacExecutor for TerraformExecutor {
    fn run_stage(&self, workdir: &WorkDir, stage: Stage) -> Result<StageOutcome> {
        let started = Instant::now();
        let command = self.stage_command(workdir.path(), stage);
        info!(stage = %stage, program = %command.program, "Starting provisioning stage");

        let raw = self.run(workdir, &command)?;
        let mut outcome = StageOutcome {
            stage,
            success: raw.success,
            stdout: raw.stdout,
            stderr: if raw.success { String::new() } else { raw.stderr },
            duration: Duration::ZERO,
            outputs: BTreeMap::new(),
        };

        if outcome.success && stage == Stage::Apply {
            let output_cmd = self.command_for(
                workdir.path(),
                vec!["output".to_string(), "-json".to_string()],
            );
            let raw = self.run(workdir, &output_cmd)?;
            let parsed = if raw.success {
                parse_outputs(&raw.stdout)
            } else {
                Err(IacError::Output(tail_lines(&raw.stderr, 20)))
            };
            match parsed {
                Ok(outputs) => outcome.outputs = outputs,
                Err(e) => {
                    outcome.success = false;
                    outcome.stderr = format!("apply succeeded but outputs could not be read: {e}");
                }
            }
        }

        outcome.duration = started.elapsed();
        info!(
            stage = %stage,
            success = outcome.success,
            duration_ms = outcome.duration.as_millis() as u64,
            "Provisioning stage finished"
        );
        Ok(outcome)
    }
}

fn ansi_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").expect("valid ANSI regex")
    })
}

/// Remove terminal escape sequences from captured output.
pub fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").into_owned()
}

/// Flatten `terraform output -json` into `name -> value` strings.
///
/// Nested objects produce dotted keys, lists are kept as JSON, sensitive
/// outputs are masked.
pub fn parse_outputs(json: &str) -> Result<BTreeMap<String, String>> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Ok(BTreeMap::new());
    }

    let document: Value =
        serde_json::from_str(trimmed).map_err(|e| IacError::Output(e.to_string()))?;
    let Value::Object(entries) = document else {
        return Err(IacError::Output("expected a JSON object".to_string()));
    };

    let mut flat = BTreeMap::new();
    for (name, entry) in entries {
        let sensitive = entry
            .get("sensitive")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let value = entry.get("value").cloned().unwrap_or(Value::Null);
        if sensitive {
            flat.insert(name, "(sensitive)".to_string());
        } else {
            flatten_into(&mut flat, name, value);
        }
    }
    Ok(flat)
}

fn flatten_into(flat: &mut BTreeMap<String, String>, key: String, value: Value) {
    match value {
        Value::Object(map) => {
            for (child, value) in map {
                flatten_into(flat, format!("{key}.{child}"), value);
            }
        }
        Value::String(s) => {
            flat.insert(key, s);
        }
        Value::Null => {
            flat.insert(key, String::new());
        }
        other => {
            flat.insert(key, other.to_string());
        }
    }
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_raw_commands() {
        let temp = TempDir::new().unwrap();
        let executor = TerraformExecutor::default();

        let plan = executor.stage_command(temp.path(), Stage::Plan);
        assert_eq!(plan.program, "terraform");
        assert_eq!(plan.args, ["plan", "-out=tfplan", "-input=false", "-no-color"]);

        let apply = executor.stage_command(temp.path(), Stage::Apply);
        assert_eq!(
            apply.args,
            ["apply", "-auto-approve", "-input=false", "-no-color", "tfplan"]
        );

        let destroy = executor.stage_command(temp.path(), Stage::Destroy);
        assert_eq!(
            destroy.args,
            ["destroy", "-auto-approve", "-input=false", "-no-color"]
        );
    }

    #[test]
    fn test_wrapper_file_dispatches_every_stage() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(WRAPPER_CONFIG_FILE), "terraform {}\n").unwrap();
        let executor = TerraformExecutor::new("/opt/tf", "/opt/tg");

        for stage in [Stage::Init, Stage::Plan, Stage::Apply, Stage::Destroy] {
            let command = executor.stage_command(temp.path(), stage);
            assert_eq!(command.program, "/opt/tg");
            assert_eq!(&command.args[..4], ["run", "--non-interactive", "--", stage.as_str()]);
        }
        let output = executor.command_for(temp.path(), vec!["output".into(), "-json".into()]);
        assert_eq!(output.program, "/opt/tg");
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(
            strip_ansi("\x1b[1m\x1b[32mApply complete!\x1b[0m Resources: 1 added."),
            "Apply complete! Resources: 1 added."
        );
    }

    #[test]
    fn test_parse_outputs_flattens() {
        let json = r#"{
            "vm_id": {"sensitive": false, "type": "string", "value": "pve/qemu/101"},
            "cores": {"sensitive": false, "type": "number", "value": 2},
            "vm": {"sensitive": false, "type": ["object", {}], "value": {"ip": "10.0.0.5", "tags": ["a"]}},
            "root_password": {"sensitive": true, "type": "string", "value": "pw"}
        }"#;
        let outputs = parse_outputs(json).unwrap();
        assert_eq!(outputs["vm_id"], "pve/qemu/101");
        assert_eq!(outputs["cores"], "2");
        assert_eq!(outputs["vm.ip"], "10.0.0.5");
        assert_eq!(outputs["vm.tags"], "[\"a\"]");
        assert_eq!(outputs["root_password"], "(sensitive)");
        assert!(parse_outputs("").unwrap().is_empty());
        assert!(parse_outputs("[1]").is_err());
    }

    #[test]
    fn test_diagnostic_prefers_stderr() {
        let outcome = StageOutcome {
            stage: Stage::Plan,
            success: false,
            stdout: "planning".to_string(),
            stderr: "Error: invalid credentials".to_string(),
            duration: Duration::ZERO,
            outputs: BTreeMap::new(),
        };
        assert_eq!(outcome.diagnostic(), "Error: invalid credentials");
    }

    #[cfg(unix)]
    #[test]
    fn test_runs_fake_tool_with_explicit_env() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let bin = temp.path().join("fake-terraform");
        std::fs::write(
            &bin,
            "#!/bin/sh\n\
             if [ \"$1\" = \"output\" ]; then echo '{\"vm_id\":{\"value\":\"vm-7\"}}'; exit 0; fi\n\
             if [ \"$1\" = \"plan\" ]; then echo 'Error: boom' >&2; exit 1; fi\n\
             printf '\\033[32m%s ok\\033[0m home=%s\\n' \"$1\" \"$HOME\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let workdir_path = temp.path().join("work");
        std::fs::create_dir_all(&workdir_path).unwrap();
        let config = crate::generator::RenderedConfig {
            mode: crate::generator::ConfigMode::Provider,
            descriptor_file: "main.tf".to_string(),
            descriptor: String::new(),
            variables: String::new(),
            registry_config: None,
        };
        let auth = crate::workdir::ModuleAuth {
            host: "git.example.com".to_string(),
            username: "u".to_string(),
            token: crate::secret::Secret::new("t"),
        };
        let workdir = WorkDir::prepare(
            &workdir_path,
            &config,
            &crate::workdir::ToolSecrets::default(),
            Some(&auth),
        )
        .unwrap();

        let executor = TerraformExecutor::new(bin.to_string_lossy(), "unused");

        let init = executor.run_stage(&workdir, Stage::Init).unwrap();
        assert!(init.success);
        assert!(init.stdout.starts_with("init ok home="));
        assert!(init.stdout.trim_end().ends_with(".home"));
        assert!(!init.stdout.contains('\x1b'));

        let plan = executor.run_stage(&workdir, Stage::Plan).unwrap();
        assert!(!plan.success);
        assert_eq!(plan.diagnostic(), "Error: boom");

        let apply = executor.run_stage(&workdir, Stage::Apply).unwrap();
        assert!(apply.success);
        assert_eq!(apply.outputs["vm_id"], "vm-7");
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let temp = TempDir::new().unwrap();
        let executor = TerraformExecutor::new("/nonexistent/terraform-binary", "unused");
        let result = executor.run_stage(&WorkDir::existing(temp.path()), Stage::Init);
        assert!(matches!(result, Err(IacError::Spawn { .. })));
    }
}
