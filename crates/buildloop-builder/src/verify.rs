use anyhow::Result;
use buildloop_core::{BuildError, Message, Role, Verdict, VerdictStatus};
use buildloop_llm::{ModelGateway, Purpose};
use regex::Regex;
use std::sync::LazyLock;

use crate::collab::{StaticAnalyzer, TestRunner};

const VERIFIER_SYSTEM_PROMPT: &str = "You are reviewing a submitted code snippet for completeness and \
     correctness. Respond with a JSON object containing 'complete' \
     (boolean) and 'feedback' (string); set 'needs_clarification' (boolean) \
     when you cannot judge the snippet without more information.";

static JSON_OBJECT_GREEDY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("json regex"));
static JSON_OBJECT_LAZY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*?\}").expect("json regex"));

#[derive(Debug, Clone)]
struct ModelJudgment {
    complete: bool,
    needs_clarification: bool,
    feedback: String,
}

/// Parse the verification model's reply. Anything ambiguous or unparseable
/// is judged incomplete — completeness is never assumed silently.
fn parse_model_judgment(text: &str) -> ModelJudgment {
    let candidate = JSON_OBJECT_GREEDY
        .find(text)
        .map(|m| m.as_str())
        .into_iter()
        .chain(JSON_OBJECT_LAZY.find(text).map(|m| m.as_str()))
        .find_map(|raw| serde_json::from_str::<serde_json::Value>(raw).ok());

    let Some(value) = candidate else {
        return ModelJudgment {
            complete: false,
            needs_clarification: false,
            feedback: "verification response carried no parseable JSON verdict".to_string(),
        };
    };

    let complete = value
        .get("complete")
        .and_then(|v| v.as_bool())
        .or_else(|| {
            value
                .get("status")
                .and_then(|v| v.as_str())
                .map(|s| s.eq_ignore_ascii_case("complete"))
        })
        .unwrap_or(false);
    let needs_clarification = value
        .get("needs_clarification")
        .and_then(|v| v.as_bool())
        .unwrap_or_else(|| {
            value
                .get("status")
                .and_then(|v| v.as_str())
                .is_some_and(|s| s.eq_ignore_ascii_case("needs_clarification"))
        });
    let feedback = value
        .get("feedback")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    ModelJudgment {
        complete,
        needs_clarification,
        feedback,
    }
}

/// Combines a model completeness judgment with static analysis and test
/// execution into one Verdict. Holds no state between calls and never
/// touches the conversation store.
pub struct Verifier<'a> {
    gateway: &'a ModelGateway,
    analyzer: &'a dyn StaticAnalyzer,
    tester: &'a dyn TestRunner,
}

impl<'a> Verifier<'a> {
    pub fn new(
        gateway: &'a ModelGateway,
        analyzer: &'a dyn StaticAnalyzer,
        tester: &'a dyn TestRunner,
    ) -> Self {
        Self {
            gateway,
            analyzer,
            tester,
        }
    }

    pub fn verify(&self, snippet: &str, branch: &str) -> Result<Verdict> {
        let transcript = vec![
            Message::new(Role::System, VERIFIER_SYSTEM_PROMPT, 1),
            Message::new(
                Role::User,
                format!(
                    "Verify the following snippet (produced in dialogue `{branch}`). \
                     Respond in JSON with fields 'complete' (boolean) and \
                     'feedback' (string).\n\n```\n{snippet}\n```"
                ),
                2,
            ),
        ];
        let response = self.gateway.generate(&transcript, Purpose::Verify)?;
        let judgment = parse_model_judgment(&response);

        let lint_findings = self.analyzer.analyze(snippet).map_err(|e| {
            BuildError::VerificationToolFailure(format!("static analysis: {e:#}"))
        })?;
        let test_result = self
            .tester
            .run(snippet)
            .map_err(|e| BuildError::VerificationToolFailure(format!("test execution: {e:#}")))?;

        // Clarification requests win; otherwise test evidence overrides the
        // model's opinion of completeness.
        let status = if judgment.needs_clarification {
            VerdictStatus::NeedsClarification
        } else if !test_result.passed || !judgment.complete {
            VerdictStatus::Incomplete
        } else {
            VerdictStatus::Complete
        };

        Ok(Verdict {
            status,
            lint_findings,
            test_result,
            model_feedback: judgment.feedback,
        })
    }
}
