use anyhow::{Result, anyhow};
use buildloop_core::{BuildError, BuilderConfig, LintFinding, TestOutcome};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

/// Static-analysis collaborator: findings for a snippet, empty if clean.
/// An `Err` means the tool itself failed, not that the code has findings.
pub trait StaticAnalyzer {
    fn analyze(&self, source: &str) -> Result<Vec<LintFinding>>;
}

/// Test-execution collaborator.
pub trait TestRunner {
    fn run(&self, source: &str) -> Result<TestOutcome>;
}

/// Writes completed snippets to durable storage.
pub trait ArtifactSink {
    fn save_artifact(&self, id: &str, source: &str) -> Result<()>;
}

/// Resolves clarifying questions; a human prompt or a scripted responder.
pub trait AnswerSource {
    fn answer(&self, question: &str) -> Result<String>;
}

#[derive(Debug)]
struct ShellRunOutcome {
    status: Option<i32>,
    stdout: String,
    stderr: String,
    timed_out: bool,
}

fn run_shell(cmd: &str, cwd: &Path, timeout: Duration) -> Result<ShellRunOutcome> {
    let mut child = spawn_shell(cmd, cwd)?;
    let status = child.wait_timeout(timeout)?;
    if status.is_none() {
        child.kill()?;
        let output = child.wait_with_output()?;
        return Ok(ShellRunOutcome {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            timed_out: true,
        });
    }
    let output = child.wait_with_output()?;
    Ok(ShellRunOutcome {
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        timed_out: false,
    })
}

#[cfg(unix)]
fn spawn_shell(cmd: &str, cwd: &Path) -> Result<std::process::Child> {
    let mut command = Command::new("sh");
    command.arg("-c").arg(cmd);
    spawn_with_pipes(command, cwd)
}

#[cfg(windows)]
fn spawn_shell(cmd: &str, cwd: &Path) -> Result<std::process::Child> {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(cmd);
    spawn_with_pipes(command, cwd)
}

fn spawn_with_pipes(mut command: Command, cwd: &Path) -> Result<std::process::Child> {
    command.current_dir(cwd);
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.stdin(Stdio::null());
    Ok(command.spawn()?)
}

fn combined_output(outcome: &ShellRunOutcome) -> String {
    let mut text = outcome.stdout.clone();
    if !outcome.stdout.is_empty() && !outcome.stderr.is_empty() {
        text.push('\n');
    }
    text.push_str(&outcome.stderr);
    text
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &text[..end])
}

/// Write the snippet to a scratch file the collaborator command can point at.
fn scratch_file(dir: &Path, suffix: &str, source: &str) -> Result<PathBuf> {
    let path = dir.join(format!("snippet{suffix}"));
    let mut f = fs::File::create(&path)?;
    f.write_all(source.as_bytes())?;
    Ok(path)
}

/// Runs the configured lint command over the snippet and parses its output
/// into findings. An empty command disables analysis (no findings).
pub struct CommandAnalyzer {
    command: String,
    suffix: String,
    timeout: Duration,
}

impl CommandAnalyzer {
    pub fn from_config(cfg: &BuilderConfig) -> Self {
        Self {
            command: cfg.lint_command.clone(),
            suffix: cfg.snippet_suffix.clone(),
            timeout: Duration::from_secs(cfg.collaborator_timeout_seconds),
        }
    }
}

impl StaticAnalyzer for CommandAnalyzer {
    fn analyze(&self, source: &str) -> Result<Vec<LintFinding>> {
        if self.command.is_empty() {
            return Ok(Vec::new());
        }
        let scratch = tempfile::tempdir()?;
        let path = scratch_file(scratch.path(), &self.suffix, source)?;
        let cmd = format!("{} {}", self.command, path.display());
        let outcome = run_shell(&cmd, scratch.path(), self.timeout)?;
        if outcome.timed_out {
            return Err(anyhow!("lint command `{}` timed out", self.command));
        }
        let output = combined_output(&outcome);
        let mut findings = parse_findings(&output);
        if findings.is_empty() && outcome.status != Some(0) {
            findings.push(LintFinding {
                line: None,
                message: format!(
                    "`{}` reported issues:\n{}",
                    self.command,
                    truncate(&output, 2000)
                ),
                severity: "warning".to_string(),
            });
        }
        Ok(findings)
    }
}

/// Parse `file:line[:col]: message` style lint output into findings.
fn parse_findings(output: &str) -> Vec<LintFinding> {
    let mut findings = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || !trimmed.contains(':') {
            continue;
        }
        let fields: Vec<&str> = trimmed.splitn(4, ':').collect();
        let line_no = fields.get(1).and_then(|f| f.trim().parse::<u32>().ok());
        if line_no.is_none() {
            continue;
        }
        let lowered = trimmed.to_lowercase();
        let severity = if lowered.contains("error") {
            "error"
        } else {
            "warning"
        };
        findings.push(LintFinding {
            line: line_no,
            message: trimmed.to_string(),
            severity: severity.to_string(),
        });
    }
    findings
}

/// Runs the configured test command against the snippet. Pass means exit
/// code zero. An empty command counts as passing (nothing to run).
pub struct CommandTestRunner {
    command: String,
    suffix: String,
    timeout: Duration,
}

impl CommandTestRunner {
    pub fn from_config(cfg: &BuilderConfig) -> Self {
        Self {
            command: cfg.test_command.clone(),
            suffix: cfg.snippet_suffix.clone(),
            timeout: Duration::from_secs(cfg.collaborator_timeout_seconds),
        }
    }
}

impl TestRunner for CommandTestRunner {
    fn run(&self, source: &str) -> Result<TestOutcome> {
        if self.command.is_empty() {
            return Ok(TestOutcome::passed("no test command configured"));
        }
        let scratch = tempfile::tempdir()?;
        let path = scratch_file(scratch.path(), &self.suffix, source)?;
        let cmd = format!("{} {}", self.command, path.display());
        let outcome = run_shell(&cmd, scratch.path(), self.timeout)?;
        if outcome.timed_out {
            return Err(anyhow!("test command `{}` timed out", self.command));
        }
        let output = truncate(&combined_output(&outcome), 2500);
        if outcome.status == Some(0) {
            Ok(TestOutcome::passed(output))
        } else {
            Ok(TestOutcome::failed(format!(
                "`{}` exited with {:?}:\n{}",
                self.command, outcome.status, output
            )))
        }
    }
}

/// Writes completed snippets into the artifacts directory, one file per
/// artifact id.
pub struct FileArtifactSink {
    dir: PathBuf,
    suffix: String,
}

impl FileArtifactSink {
    pub fn new(dir: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            suffix: suffix.into(),
        }
    }
}

impl ArtifactSink for FileArtifactSink {
    fn save_artifact(&self, id: &str, source: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            BuildError::PersistenceFailure(format!("creating {:?}: {e}", self.dir))
        })?;
        let path = self.dir.join(format!("{id}{}", self.suffix));
        fs::write(&path, source)
            .map_err(|e| BuildError::PersistenceFailure(format!("writing {path:?}: {e}")))?;
        Ok(())
    }
}

/// Answers clarifying questions from a prepared script, falling back to a
/// canned auto-answer once the script runs dry. Used for non-interactive
/// runs.
pub struct ScriptedAnswerSource {
    script: RefCell<VecDeque<String>>,
}

impl ScriptedAnswerSource {
    pub fn new(answers: Vec<String>) -> Self {
        Self {
            script: RefCell::new(answers.into()),
        }
    }
}

impl Default for ScriptedAnswerSource {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl AnswerSource for ScriptedAnswerSource {
    fn answer(&self, question: &str) -> Result<String> {
        Ok(self.script.borrow_mut().pop_front().unwrap_or_else(|| {
            format!("Auto-answer for '{question}': proceed with sensible defaults.")
        }))
    }
}

/// Surfaces clarifying questions on the terminal and reads the answer from
/// stdin.
#[derive(Debug, Default)]
pub struct StdinAnswerSource;

impl AnswerSource for StdinAnswerSource {
    fn answer(&self, question: &str) -> Result<String> {
        println!("Clarifying question: {question}");
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        let read = std::io::stdin().lock().read_line(&mut line)?;
        if read == 0 {
            return Err(anyhow!("answer source closed (stdin at EOF)"));
        }
        Ok(line.trim().to_string())
    }
}
