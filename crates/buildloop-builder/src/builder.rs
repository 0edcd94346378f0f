use anyhow::{Result, anyhow};
use buildloop_core::{
    AbandonReason, BuildError, BuildTask, BuilderConfig, ROOT_BRANCH, Role, TaskRecord,
    TaskReport, TaskState, Verdict, VerdictStatus, is_valid_task_transition,
};
use buildloop_llm::{ModelGateway, Purpose};
use buildloop_observe::Observer;
use buildloop_store::ConversationStore;
use std::collections::BTreeMap;

use crate::collab::{AnswerSource, ArtifactSink, StaticAnalyzer, TestRunner};
use crate::extract;
use crate::verify::Verifier;

/// External collaborators the builder drives but does not implement.
pub struct Collaborators {
    pub analyzer: Box<dyn StaticAnalyzer>,
    pub tester: Box<dyn TestRunner>,
    pub artifacts: Box<dyn ArtifactSink>,
    pub answers: Box<dyn AnswerSource>,
}

/// Drives one build-task tree to a terminal state: draft a part, resolve
/// clarifying questions through forked sub-dialogues, verify candidates,
/// and recurse on incomplete output until complete or the depth bound.
///
/// Control flow is depth-first and single-threaded: one task runs
/// end-to-end before its refinement child begins, so at most one model
/// call, one verification, and one store mutation are in flight per tree.
pub struct RecursiveBuilder {
    gateway: ModelGateway,
    store: ConversationStore,
    observer: Observer,
    collaborators: Collaborators,
    cfg: BuilderConfig,
    part_counters: BTreeMap<String, u32>,
}

impl RecursiveBuilder {
    pub fn new(
        gateway: ModelGateway,
        store: ConversationStore,
        observer: Observer,
        collaborators: Collaborators,
        cfg: BuilderConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            observer,
            collaborators,
            cfg,
            part_counters: BTreeMap::new(),
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Run a fresh task tree for the given top-level prompt. Fatal errors
    /// are mapped onto an `Abandoned` report with the diagnostic retained;
    /// the caller never sees a bare failure without an artifact.
    pub fn run(&mut self, prompt: &str) -> Result<TaskReport> {
        let task = BuildTask::root(ROOT_BRANCH);
        self.observer
            .event(&format!("root task {} started", task.task_id));
        match self.run_task(&task, prompt.to_string()) {
            Ok(report) => Ok(report),
            Err(err) => {
                let reason = derive_reason(&err, AbandonReason::Persistence);
                self.observer
                    .warn(&format!("task tree failed ({}): {err:#}", reason.as_str()));
                let _ = self.store.record_task(TaskRecord {
                    task_id: task.task_id,
                    branch: task.branch.clone(),
                    depth: task.depth,
                    parent: task.parent,
                    state: TaskState::Abandoned,
                });
                Ok(abandoned_report(&task, None, None, reason, format!("{err:#}")))
            }
        }
    }

    fn run_task(&mut self, task: &BuildTask, prompt: String) -> Result<TaskReport> {
        let mut state = TaskState::Drafting;
        self.record(task, state)?;
        self.store.append(&task.branch, Role::User, prompt)?;
        let mut clarification_rounds = 0u32;

        'drafting: loop {
            let transcript = self.store.load(&task.branch)?.to_vec();
            let response = match self.gateway.generate(&transcript, Purpose::Generate) {
                Ok(text) => text,
                Err(err) => {
                    return self.abandon(
                        task,
                        &mut state,
                        None,
                        None,
                        AbandonReason::ModelUnavailable,
                        &err,
                    );
                }
            };
            self.store.append(&task.branch, Role::Assistant, &response)?;
            let parsed = extract::questions_and_code(&response);

            // Ambiguity resolves before code: a clarifying question takes
            // priority even when a snippet arrived in the same response.
            if !parsed.questions.is_empty()
                && clarification_rounds < self.cfg.max_clarification_rounds
            {
                self.transition(task, &mut state, TaskState::AwaitingClarification)?;
                for question in &parsed.questions {
                    self.clarify(task, question)?;
                }
                clarification_rounds += 1;
                self.transition(task, &mut state, TaskState::Drafting)?;
                continue 'drafting;
            }

            if parsed.code_blocks.is_empty() {
                self.observer.warn(&format!(
                    "{}: response carried no fenced code block",
                    task.branch
                ));
                let feedback = "The last response contained no fenced code block. \
                                Reply with the code for this part inside triple backticks."
                    .to_string();
                return self.refine_or_abandon(task, &mut state, None, None, feedback);
            }

            self.transition(task, &mut state, TaskState::Verifying)?;
            let mut last_complete: Option<(String, String, Verdict)> = None;
            for snippet in &parsed.code_blocks {
                let verdict = {
                    let verifier = Verifier::new(
                        &self.gateway,
                        self.collaborators.analyzer.as_ref(),
                        self.collaborators.tester.as_ref(),
                    );
                    verifier.verify(snippet, &task.branch)
                };
                let verdict = match verdict {
                    Ok(v) => v,
                    Err(err) => {
                        return self.abandon(
                            task,
                            &mut state,
                            Some(snippet.clone()),
                            None,
                            AbandonReason::VerificationTool,
                            &err,
                        );
                    }
                };
                self.observer.event(&format!(
                    "{}: verdict {:?} (tests {})",
                    task.branch,
                    verdict.status,
                    if verdict.test_result.passed {
                        "passed"
                    } else {
                        "failed"
                    }
                ));

                match verdict.status {
                    VerdictStatus::NeedsClarification => {
                        if clarification_rounds < self.cfg.max_clarification_rounds {
                            self.transition(task, &mut state, TaskState::AwaitingClarification)?;
                            let question = if verdict.model_feedback.is_empty() {
                                "The verifier needs more information about this part. \
                                 What should be clarified?"
                                    .to_string()
                            } else {
                                verdict.model_feedback.clone()
                            };
                            self.clarify(task, &question)?;
                            clarification_rounds += 1;
                            self.transition(task, &mut state, TaskState::Drafting)?;
                            continue 'drafting;
                        }
                        // Clarification budget exhausted: fail closed into
                        // a refinement cycle instead.
                        let feedback = verdict.feedback_text();
                        return self.refine_or_abandon(
                            task,
                            &mut state,
                            Some(snippet.clone()),
                            Some(verdict),
                            feedback,
                        );
                    }
                    VerdictStatus::Incomplete => {
                        let feedback = verdict.feedback_text();
                        return self.refine_or_abandon(
                            task,
                            &mut state,
                            Some(snippet.clone()),
                            Some(verdict),
                            feedback,
                        );
                    }
                    VerdictStatus::Complete => {
                        let artifact_id = self.next_artifact_id(&task.branch);
                        if let Err(err) = self
                            .collaborators
                            .artifacts
                            .save_artifact(&artifact_id, snippet)
                        {
                            return self.abandon(
                                task,
                                &mut state,
                                Some(snippet.clone()),
                                Some(verdict),
                                AbandonReason::Persistence,
                                &err,
                            );
                        }
                        self.observer
                            .event(&format!("{}: artifact {artifact_id} saved", task.branch));
                        last_complete = Some((artifact_id, snippet.clone(), verdict));
                    }
                }
            }

            // Every candidate block verified complete.
            self.transition(task, &mut state, TaskState::Complete)?;
            let Some((artifact_id, snippet, verdict)) = last_complete else {
                return Err(anyhow!("verified zero candidate blocks"));
            };
            return Ok(TaskReport {
                task_id: task.task_id,
                branch: task.branch.clone(),
                state: TaskState::Complete,
                depth: task.depth,
                snippet: Some(snippet),
                verdict: Some(verdict),
                reason: None,
                detail: None,
                artifact_id: Some(artifact_id),
            });
        }
    }

    /// Clarifying-question sub-dialogue: fork, surface the question to the
    /// answer source, append the answer to the sub-branch, merge back. The
    /// exchange stays in the parent branch for coherence.
    fn clarify(&mut self, task: &BuildTask, question: &str) -> Result<()> {
        let child = self.store.fork(&task.branch)?;
        self.observer
            .event(&format!("{}: clarifying on {child}: {question}", task.branch));
        let answer = self.collaborators.answers.answer(question)?;
        self.store.append(&child, Role::User, answer)?;
        self.store.merge(&child, &task.branch)?;
        Ok(())
    }

    /// Either hand the verdict feedback to a depth+1 child task or, at the
    /// depth bound, terminate with the last candidate attached.
    fn refine_or_abandon(
        &mut self,
        task: &BuildTask,
        state: &mut TaskState,
        snippet: Option<String>,
        verdict: Option<Verdict>,
        feedback: String,
    ) -> Result<TaskReport> {
        if task.depth >= self.cfg.max_depth {
            self.transition(task, state, TaskState::Abandoned)?;
            self.observer.warn(&format!(
                "task {} abandoned: no complete verdict within depth bound {}",
                task.task_id, self.cfg.max_depth
            ));
            return Ok(abandoned_report(
                task,
                snippet,
                verdict,
                AbandonReason::DepthExceeded,
                format!("no complete verdict within depth bound {}", self.cfg.max_depth),
            ));
        }

        self.transition(task, state, TaskState::Refining)?;
        let child = task.refine();
        self.observer.event(&format!(
            "{}: refining into task {} at depth {}",
            task.branch, child.task_id, child.depth
        ));
        let prompt = match &snippet {
            Some(code) => format!(
                "We received the following feedback from a verification step:\n\n\
                 {feedback}\n\n\
                 Please refine the following code snippet to address these issues. \
                 Reply with the full refined snippet in triple backticks:\n\n\
                 ```\n{code}\n```"
            ),
            None => feedback,
        };
        self.run_task(&child, prompt)
    }

    fn abandon(
        &mut self,
        task: &BuildTask,
        state: &mut TaskState,
        snippet: Option<String>,
        verdict: Option<Verdict>,
        fallback: AbandonReason,
        err: &anyhow::Error,
    ) -> Result<TaskReport> {
        let reason = derive_reason(err, fallback);
        self.transition(task, state, TaskState::Abandoned)?;
        self.observer.warn(&format!(
            "task {} abandoned ({}): {err:#}",
            task.task_id,
            reason.as_str()
        ));
        Ok(abandoned_report(
            task,
            snippet,
            verdict,
            reason,
            format!("{err:#}"),
        ))
    }

    fn transition(&mut self, task: &BuildTask, state: &mut TaskState, to: TaskState) -> Result<()> {
        if !is_valid_task_transition(*state, to) {
            return Err(anyhow!("invalid task transition {:?} -> {to:?}", *state));
        }
        *state = to;
        self.record(task, to)
    }

    fn record(&mut self, task: &BuildTask, state: TaskState) -> Result<()> {
        self.store.record_task(TaskRecord {
            task_id: task.task_id,
            branch: task.branch.clone(),
            depth: task.depth,
            parent: task.parent,
            state,
        })?;
        self.observer.event(&format!(
            "task {} [{} depth {}] {state:?}",
            task.task_id, task.branch, task.depth
        ));
        Ok(())
    }

    /// Artifact identifiers derive from tree position, so sibling parts
    /// never collide.
    fn next_artifact_id(&mut self, branch: &str) -> String {
        let counter = self.part_counters.entry(branch.to_string()).or_insert(0);
        *counter += 1;
        format!("{}.part{}", branch.replace('/', "."), counter)
    }
}

fn derive_reason(err: &anyhow::Error, fallback: AbandonReason) -> AbandonReason {
    match err.downcast_ref::<BuildError>() {
        Some(BuildError::ModelUnavailable { .. }) => AbandonReason::ModelUnavailable,
        Some(BuildError::VerificationToolFailure(_)) => AbandonReason::VerificationTool,
        Some(BuildError::PersistenceFailure(_)) => AbandonReason::Persistence,
        Some(BuildError::MalformedResponse(_)) | None => fallback,
    }
}

fn abandoned_report(
    task: &BuildTask,
    snippet: Option<String>,
    verdict: Option<Verdict>,
    reason: AbandonReason,
    detail: String,
) -> TaskReport {
    TaskReport {
        task_id: task.task_id,
        branch: task.branch.clone(),
        state: TaskState::Abandoned,
        depth: task.depth,
        snippet,
        verdict,
        reason: Some(reason),
        detail: Some(detail),
        artifact_id: None,
    }
}
