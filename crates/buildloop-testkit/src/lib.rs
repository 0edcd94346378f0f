//! Scripted collaborator and backend doubles for exercising the build loop
//! without a network or real toolchain.

use anyhow::{Result, anyhow};
use buildloop_builder::{AnswerSource, ArtifactSink, StaticAnalyzer, TestRunner};
use buildloop_core::{LintFinding, Message, TestOutcome};
use buildloop_llm::{BackendError, ModelBackend, Purpose};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

pub type BackendReply = std::result::Result<String, BackendError>;

pub fn transient(detail: &str) -> BackendError {
    BackendError::Transient {
        detail: detail.to_string(),
        retry_after_seconds: None,
    }
}

pub fn fatal(detail: &str) -> BackendError {
    BackendError::Fatal(detail.to_string())
}

/// Backend scripted per purpose: generation replies and verification
/// replies are independent queues, drained in call order. Running dry is a
/// fatal scripting error so tests fail loudly instead of looping.
pub struct ScriptedBackend {
    generate: RefCell<VecDeque<BackendReply>>,
    verify: RefCell<VecDeque<BackendReply>>,
    calls: Rc<RefCell<Vec<Purpose>>>,
}

impl ScriptedBackend {
    pub fn new(generate: Vec<BackendReply>, verify: Vec<BackendReply>) -> Self {
        Self {
            generate: RefCell::new(generate.into()),
            verify: RefCell::new(verify.into()),
            calls: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Shared handle onto the purpose log; survives moving the backend into
    /// a gateway.
    pub fn calls(&self) -> Rc<RefCell<Vec<Purpose>>> {
        self.calls.clone()
    }
}

impl ModelBackend for ScriptedBackend {
    fn call(
        &self,
        _messages: &[Message],
        _model: &str,
        purpose: Purpose,
    ) -> std::result::Result<String, BackendError> {
        self.calls.borrow_mut().push(purpose);
        let queue = match purpose {
            Purpose::Generate => &self.generate,
            Purpose::Verify => &self.verify,
        };
        queue
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(fatal("scripted backend ran out of replies")))
    }
}

pub struct ScriptedAnalyzer {
    findings: Vec<LintFinding>,
    error: Option<String>,
}

impl ScriptedAnalyzer {
    pub fn clean() -> Self {
        Self {
            findings: Vec::new(),
            error: None,
        }
    }

    pub fn with_findings(findings: Vec<LintFinding>) -> Self {
        Self {
            findings,
            error: None,
        }
    }

    pub fn broken(detail: &str) -> Self {
        Self {
            findings: Vec::new(),
            error: Some(detail.to_string()),
        }
    }
}

impl StaticAnalyzer for ScriptedAnalyzer {
    fn analyze(&self, _source: &str) -> Result<Vec<LintFinding>> {
        match &self.error {
            Some(detail) => Err(anyhow!("{detail}")),
            None => Ok(self.findings.clone()),
        }
    }
}

/// Test runner scripted as a queue of outcomes; once the queue is dry it
/// repeats the final configured outcome (or passes by default).
pub struct ScriptedTester {
    outcomes: RefCell<VecDeque<TestOutcome>>,
    fallback: TestOutcome,
    error: Option<String>,
}

impl ScriptedTester {
    pub fn passing() -> Self {
        Self::with_outcome(TestOutcome::passed("all tests passed"))
    }

    pub fn failing(details: &str) -> Self {
        Self::with_outcome(TestOutcome::failed(details))
    }

    pub fn with_outcome(outcome: TestOutcome) -> Self {
        Self {
            outcomes: RefCell::new(VecDeque::new()),
            fallback: outcome,
            error: None,
        }
    }

    /// Yield the given outcomes in order, then keep repeating the last one.
    pub fn sequence(outcomes: Vec<TestOutcome>) -> Self {
        let fallback = outcomes
            .last()
            .cloned()
            .unwrap_or_else(|| TestOutcome::passed("all tests passed"));
        Self {
            outcomes: RefCell::new(outcomes.into()),
            fallback,
            error: None,
        }
    }

    pub fn broken(detail: &str) -> Self {
        Self {
            outcomes: RefCell::new(VecDeque::new()),
            fallback: TestOutcome::passed(""),
            error: Some(detail.to_string()),
        }
    }
}

impl TestRunner for ScriptedTester {
    fn run(&self, _source: &str) -> Result<TestOutcome> {
        if let Some(detail) = &self.error {
            return Err(anyhow!("{detail}"));
        }
        Ok(self
            .outcomes
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Collects saved artifacts in memory.
#[derive(Default)]
pub struct MemorySink {
    saved: Rc<RefCell<Vec<(String, String)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Rc<RefCell<Vec<(String, String)>>> {
        self.saved.clone()
    }
}

impl ArtifactSink for MemorySink {
    fn save_artifact(&self, id: &str, source: &str) -> Result<()> {
        self.saved
            .borrow_mut()
            .push((id.to_string(), source.to_string()));
        Ok(())
    }
}

/// Artifact sink that always fails, for persistence-failure paths.
pub struct FailingSink;

impl ArtifactSink for FailingSink {
    fn save_artifact(&self, id: &str, _source: &str) -> Result<()> {
        Err(buildloop_core::BuildError::PersistenceFailure(format!(
            "refusing to save `{id}`"
        ))
        .into())
    }
}

/// Records the questions it was asked alongside the scripted answers.
pub struct RecordingAnswerSource {
    answers: RefCell<VecDeque<String>>,
    asked: Rc<RefCell<Vec<String>>>,
}

impl RecordingAnswerSource {
    pub fn new(answers: Vec<String>) -> Self {
        Self {
            answers: RefCell::new(answers.into()),
            asked: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn asked(&self) -> Rc<RefCell<Vec<String>>> {
        self.asked.clone()
    }
}

impl AnswerSource for RecordingAnswerSource {
    fn answer(&self, question: &str) -> Result<String> {
        self.asked.borrow_mut().push(question.to_string());
        Ok(self
            .answers
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| format!("Auto-answer for '{question}'.")))
    }
}
