use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

pub const ROOT_BRANCH: &str = "root";

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".buildloop")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One transcript entry. Immutable once appended; `seq` is assigned by the
/// store per branch and survives trimming untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub seq: u64,
    pub at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, seq: u64) -> Self {
        Self {
            role,
            content: content.into(),
            seq,
            at: Utc::now(),
        }
    }
}

/// One unit of recursive work, tied to a conversation branch.
/// Depth grows by exactly one per refinement; the root task has no parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildTask {
    pub task_id: Uuid,
    pub branch: String,
    pub depth: u32,
    pub parent: Option<Uuid>,
}

impl BuildTask {
    pub fn root(branch: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::now_v7(),
            branch: branch.into(),
            depth: 0,
            parent: None,
        }
    }

    /// The refinement child: same branch, one level deeper.
    #[must_use]
    pub fn refine(&self) -> Self {
        Self {
            task_id: Uuid::now_v7(),
            branch: self.branch.clone(),
            depth: self.depth + 1,
            parent: Some(self.task_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Drafting,
    AwaitingClarification,
    Verifying,
    Refining,
    Complete,
    Abandoned,
}

impl TaskState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Abandoned)
    }
}

pub fn is_valid_task_transition(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    match from {
        // Drafting may refine directly when the response carried neither
        // code nor a question (malformed output drives a refinement cycle).
        Drafting => matches!(to, Verifying | AwaitingClarification | Refining | Abandoned),
        AwaitingClarification => matches!(to, Drafting | Abandoned),
        Verifying => matches!(to, Complete | Refining | AwaitingClarification | Abandoned),
        Refining => matches!(to, Drafting | Abandoned),
        // Terminal states are never left.
        Complete | Abandoned => false,
    }
}

/// Why a task ended in `Abandoned`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbandonReason {
    DepthExceeded,
    ModelUnavailable,
    VerificationTool,
    Persistence,
}

impl AbandonReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DepthExceeded => "depth-exceeded",
            Self::ModelUnavailable => "model-unavailable",
            Self::VerificationTool => "verification-tool-failure",
            Self::Persistence => "persistence-failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Complete,
    Incomplete,
    NeedsClarification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LintFinding {
    pub line: Option<u32>,
    pub message: String,
    pub severity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub passed: bool,
    pub details: String,
}

impl TestOutcome {
    pub fn passed(details: impl Into<String>) -> Self {
        Self {
            passed: true,
            details: details.into(),
        }
    }

    pub fn failed(details: impl Into<String>) -> Self {
        Self {
            passed: false,
            details: details.into(),
        }
    }
}

/// Combined outcome of one verification call: model judgment, static
/// analysis findings, and test execution. Produced fresh per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    pub lint_findings: Vec<LintFinding>,
    pub test_result: TestOutcome,
    pub model_feedback: String,
}

impl Verdict {
    /// Render the verdict as refinement feedback for the conversation.
    #[must_use]
    pub fn feedback_text(&self) -> String {
        let mut parts = Vec::new();
        if !self.model_feedback.is_empty() {
            parts.push(format!("Verifier feedback: {}", self.model_feedback));
        }
        if !self.test_result.passed {
            parts.push(format!("Tests failed:\n{}", self.test_result.details));
        }
        if !self.lint_findings.is_empty() {
            let findings = self
                .lint_findings
                .iter()
                .map(|f| match f.line {
                    Some(line) => format!("- line {line} [{}]: {}", f.severity, f.message),
                    None => format!("- [{}]: {}", f.severity, f.message),
                })
                .collect::<Vec<_>>()
                .join("\n");
            parts.push(format!("Static analysis findings:\n{findings}"));
        }
        if parts.is_empty() {
            parts.push("The snippet was judged incomplete.".to_string());
        }
        parts.join("\n\n")
    }
}

/// Terminal outcome of a task tree, reported to the caller. An abandoned
/// task still carries its last candidate and verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: Uuid,
    pub branch: String,
    pub state: TaskState,
    pub depth: u32,
    pub snippet: Option<String>,
    pub verdict: Option<Verdict>,
    pub reason: Option<AbandonReason>,
    pub detail: Option<String>,
    pub artifact_id: Option<String>,
}

/// Task-tree resumption metadata persisted alongside the transcripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub branch: String,
    pub depth: u32,
    pub parent: Option<Uuid>,
    pub state: TaskState,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("model unavailable after {attempts} attempt(s): {detail}")]
    ModelUnavailable { attempts: u32, detail: String },
    #[error("malformed model response: {0}")]
    MalformedResponse(String),
    #[error("verification tool failure: {0}")]
    VerificationToolFailure(String),
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

// ── Configuration ──────────────────────────────────────────────────────

pub const DEEPSEEK_ENDPOINT: &str = "https://api.deepseek.com/chat/completions";
pub const OPENAI_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub builder: BuilderConfig,
    pub store: StoreConfig,
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".buildloop/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn legacy_toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    /// Merge defaults ← legacy TOML ← user ← project ← project-local.
    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let legacy = Self::legacy_toml_path(workspace);
        if legacy.exists() {
            let raw = fs::read_to_string(legacy)?;
            let legacy_cfg: AppConfig = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &serde_json::to_value(legacy_cfg)?);
        }

        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn ensure(workspace: &Path) -> Result<Self> {
        let path = Self::project_settings_path(workspace);
        if path.exists()
            || Self::project_local_settings_path(workspace).exists()
            || Self::legacy_toml_path(workspace).exists()
            || Self::user_settings_path().is_some_and(|p| p.exists())
        {
            return Self::load(workspace);
        }
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        let cfg = Self::default();
        cfg.save(workspace)?;
        Ok(cfg)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub generate_model: String,
    pub verify_model: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            // Endpoint and key env are resolved per provider when left empty.
            endpoint: String::new(),
            api_key: None,
            api_key_env: String::new(),
            generate_model: "deepseek-chat".to_string(),
            verify_model: "deepseek-chat".to_string(),
            timeout_seconds: 60,
            max_retries: 3,
            retry_base_ms: 400,
            retry_max_ms: 10_000,
        }
    }
}

fn default_system_prompt() -> String {
    "You are a code generator. Clarify requirements with questions when \
     details are missing, and otherwise produce the next part of the \
     application as a fenced code block. Keep responses focused; the \
     conversation window is bounded."
        .to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    pub max_depth: u32,
    pub max_clarification_rounds: u32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    pub artifacts_dir: String,
    /// File suffix for scratch snippets and saved artifacts (the language
    /// the generator is asked to produce).
    pub snippet_suffix: String,
    pub lint_command: String,
    pub test_command: String,
    pub collaborator_timeout_seconds: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_clarification_rounds: 3,
            system_prompt: default_system_prompt(),
            artifacts_dir: "artifacts".to_string(),
            snippet_suffix: ".py".to_string(),
            lint_command: String::new(),
            test_command: String::new(),
            collaborator_timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_conversation_length: usize,
    pub state_file: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_conversation_length: 20,
            state_file: "conversation_state.json".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serializes_lowercase() {
        let msg = Message::new(Role::System, "framing", 1);
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["role"], "system");
        assert_eq!(json["seq"], 1);
    }

    #[test]
    fn refine_increments_depth_and_links_parent() {
        let root = BuildTask::root(ROOT_BRANCH);
        let child = root.refine();
        assert_eq!(child.depth, 1);
        assert_eq!(child.branch, root.branch);
        assert_eq!(child.parent, Some(root.task_id));
        assert_eq!(child.refine().depth, 2);
    }

    #[test]
    fn drafting_transitions() {
        assert!(is_valid_task_transition(
            TaskState::Drafting,
            TaskState::Verifying
        ));
        assert!(is_valid_task_transition(
            TaskState::Drafting,
            TaskState::AwaitingClarification
        ));
        assert!(is_valid_task_transition(
            TaskState::Drafting,
            TaskState::Refining
        ));
        assert!(!is_valid_task_transition(
            TaskState::Drafting,
            TaskState::Complete
        ));
    }

    #[test]
    fn verifying_transitions() {
        assert!(is_valid_task_transition(
            TaskState::Verifying,
            TaskState::Complete
        ));
        assert!(is_valid_task_transition(
            TaskState::Verifying,
            TaskState::Refining
        ));
        assert!(is_valid_task_transition(
            TaskState::Verifying,
            TaskState::Abandoned
        ));
        assert!(!is_valid_task_transition(
            TaskState::Verifying,
            TaskState::Drafting
        ));
    }

    #[test]
    fn terminal_states_are_never_left() {
        for to in [
            TaskState::Drafting,
            TaskState::AwaitingClarification,
            TaskState::Verifying,
            TaskState::Refining,
            TaskState::Complete,
            TaskState::Abandoned,
        ] {
            assert!(!is_valid_task_transition(TaskState::Complete, to));
            assert!(!is_valid_task_transition(TaskState::Abandoned, to));
        }
    }

    #[test]
    fn refining_returns_to_drafting_only() {
        assert!(is_valid_task_transition(
            TaskState::Refining,
            TaskState::Drafting
        ));
        assert!(!is_valid_task_transition(
            TaskState::Refining,
            TaskState::Verifying
        ));
    }

    #[test]
    fn verdict_feedback_includes_all_sections() {
        let verdict = Verdict {
            status: VerdictStatus::Incomplete,
            lint_findings: vec![LintFinding {
                line: Some(3),
                message: "unused variable".to_string(),
                severity: "warning".to_string(),
            }],
            test_result: TestOutcome::failed("assertion failed"),
            model_feedback: "missing error handling".to_string(),
        };
        let text = verdict.feedback_text();
        assert!(text.contains("missing error handling"));
        assert!(text.contains("assertion failed"));
        assert!(text.contains("unused variable"));
        assert!(text.contains("line 3"));
    }

    #[test]
    fn verdict_feedback_never_empty() {
        let verdict = Verdict {
            status: VerdictStatus::Incomplete,
            lint_findings: Vec::new(),
            test_result: TestOutcome::passed(""),
            model_feedback: String::new(),
        };
        assert!(!verdict.feedback_text().is_empty());
    }

    #[test]
    fn config_defaults_round_trip() {
        let cfg = AppConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let back: AppConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.llm.provider, "deepseek");
        assert_eq!(back.builder.max_depth, 5);
        assert_eq!(back.store.max_conversation_length, 20);
    }

    #[test]
    fn project_settings_override_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = runtime_dir(temp.path());
        fs::create_dir_all(&dir).expect("runtime dir");
        fs::write(
            dir.join("settings.json"),
            r#"{"builder": {"max_depth": 9}}"#,
        )
        .expect("write settings");
        let cfg = AppConfig::load(temp.path()).expect("load");
        assert_eq!(cfg.builder.max_depth, 9);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.store.max_conversation_length, 20);
    }

    #[test]
    fn local_settings_override_project_settings() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = runtime_dir(temp.path());
        fs::create_dir_all(&dir).expect("runtime dir");
        fs::write(
            dir.join("settings.json"),
            r#"{"llm": {"generate_model": "deepseek-chat"}}"#,
        )
        .expect("write settings");
        fs::write(
            dir.join("settings.local.json"),
            r#"{"llm": {"generate_model": "deepseek-reasoner"}}"#,
        )
        .expect("write local settings");
        let cfg = AppConfig::load(temp.path()).expect("load");
        assert_eq!(cfg.llm.generate_model, "deepseek-reasoner");
    }

    #[test]
    fn legacy_toml_sits_beneath_json_layers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = runtime_dir(temp.path());
        fs::create_dir_all(&dir).expect("runtime dir");
        fs::write(dir.join("config.toml"), "[builder]\nmax_depth = 2\n").expect("write toml");
        let cfg = AppConfig::load(temp.path()).expect("load");
        assert_eq!(cfg.builder.max_depth, 2);

        fs::write(
            dir.join("settings.json"),
            r#"{"builder": {"max_depth": 7}}"#,
        )
        .expect("write settings");
        let cfg = AppConfig::load(temp.path()).expect("load");
        assert_eq!(cfg.builder.max_depth, 7);
    }

    #[test]
    fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = AppConfig {
            builder: BuilderConfig {
                max_depth: 4,
                ..BuilderConfig::default()
            },
            ..AppConfig::default()
        };
        cfg.save(temp.path()).expect("save");
        assert!(AppConfig::project_settings_path(temp.path()).exists());
        let loaded = AppConfig::load(temp.path()).expect("load");
        assert_eq!(loaded.builder.max_depth, 4);
    }
}
