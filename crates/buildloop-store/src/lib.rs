use anyhow::anyhow;
use buildloop_core::{BuildError, Message, Result, Role, StoreConfig, TaskRecord, runtime_dir};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Where a branch split off its parent: the highest message seq shared
/// with the parent at fork time. Messages with a later seq are the child's
/// own, a boundary that survives window trims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkPoint {
    pub parent: String,
    pub last_shared_seq: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct PersistedState {
    branches: BTreeMap<String, Vec<Message>>,
    fork_points: BTreeMap<String, ForkPoint>,
    closed: BTreeSet<String>,
    tasks: Vec<TaskRecord>,
}

/// Branch-per-dialogue conversation store with a sliding retention window.
///
/// Owns message ordering and the trimming policy. Every mutation is
/// persisted synchronously (temp file + rename) before the call returns, so
/// the on-disk document always reflects the in-memory state. The system
/// framing message is reseeded from configuration, never recovered from
/// history.
pub struct ConversationStore {
    state_path: PathBuf,
    max_len: usize,
    system_prompt: String,
    state: PersistedState,
}

impl ConversationStore {
    pub fn open(workspace: &Path, cfg: &StoreConfig, system_prompt: &str) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)
            .map_err(|e| BuildError::PersistenceFailure(format!("creating {dir:?}: {e}")))?;
        let state_path = dir.join(&cfg.state_file);
        let state = if state_path.exists() {
            let raw = fs::read_to_string(&state_path).map_err(|e| {
                BuildError::PersistenceFailure(format!("reading {state_path:?}: {e}"))
            })?;
            serde_json::from_str(&raw).map_err(|e| {
                BuildError::PersistenceFailure(format!("parsing {state_path:?}: {e}"))
            })?
        } else {
            PersistedState::default()
        };
        Ok(Self {
            state_path,
            max_len: cfg.max_conversation_length,
            system_prompt: system_prompt.to_string(),
            state,
        })
    }

    /// Drop all persisted conversation state and start fresh.
    pub fn reset(&mut self) -> Result<()> {
        self.state = PersistedState::default();
        self.persist()
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.state.branches.contains_key(branch)
    }

    /// Read a branch transcript without seeding it.
    pub fn messages(&self, branch: &str) -> Option<&[Message]> {
        self.state.branches.get(branch).map(Vec::as_slice)
    }

    /// The branch transcript, seeded with the system framing message if the
    /// branch does not exist yet.
    pub fn load(&mut self, branch: &str) -> Result<&[Message]> {
        if !self.state.branches.contains_key(branch) {
            let seed = vec![Message::new(Role::System, self.system_prompt.clone(), 1)];
            self.state.branches.insert(branch.to_string(), seed);
            self.persist()?;
        }
        Ok(self
            .state
            .branches
            .get(branch)
            .map(Vec::as_slice)
            .unwrap_or_default())
    }

    pub fn append(&mut self, branch: &str, role: Role, content: impl Into<String>) -> Result<()> {
        self.load(branch)?;
        let max_len = self.max_len;
        let messages = self
            .state
            .branches
            .get_mut(branch)
            .ok_or_else(|| anyhow!("branch `{branch}` vanished"))?;
        let seq = next_seq(messages);
        messages.push(Message::new(role, content, seq));
        trim_window(messages, max_len);
        self.persist()
    }

    /// New sub-branch sharing the parent's transcript at fork time. Used
    /// for clarifying-question dialogues so they can be merged back or
    /// discarded independently.
    pub fn fork(&mut self, parent: &str) -> Result<String> {
        self.load(parent)?;
        let transcript = self
            .state
            .branches
            .get(parent)
            .cloned()
            .unwrap_or_default();
        let mut n = 1;
        let child = loop {
            let candidate = format!("{parent}/q{n}");
            if !self.state.branches.contains_key(&candidate) {
                break candidate;
            }
            n += 1;
        };
        self.state.fork_points.insert(
            child.clone(),
            ForkPoint {
                parent: parent.to_string(),
                last_shared_seq: transcript.iter().map(|m| m.seq).max().unwrap_or(0),
            },
        );
        self.state.branches.insert(child.clone(), transcript);
        self.persist()?;
        Ok(child)
    }

    /// Append the child's messages since the fork point onto the parent, in
    /// order, then close the child. The child transcript is retained (never
    /// deleted automatically) but refuses further writes.
    pub fn merge(&mut self, child: &str, parent: &str) -> Result<()> {
        let fork = self
            .state
            .fork_points
            .get(child)
            .cloned()
            .ok_or_else(|| anyhow!("branch `{child}` has no fork point"))?;
        if fork.parent != parent {
            return Err(anyhow!(
                "branch `{child}` forked from `{}`, not `{parent}`",
                fork.parent
            ));
        }
        if self.state.closed.contains(child) {
            return Err(anyhow!("branch `{child}` is already closed"));
        }
        let tail: Vec<Message> = self
            .state
            .branches
            .get(child)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| m.seq > fork.last_shared_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        self.load(parent)?;
        let max_len = self.max_len;
        let messages = self
            .state
            .branches
            .get_mut(parent)
            .ok_or_else(|| anyhow!("branch `{parent}` vanished"))?;
        for msg in tail {
            let seq = next_seq(messages);
            messages.push(Message {
                seq,
                ..msg
            });
        }
        trim_window(messages, max_len);
        self.state.closed.insert(child.to_string());
        self.persist()
    }

    /// Plain-text rendering of a branch, one `ROLE:\ncontent` block per
    /// message.
    pub fn flattened(&self, branch: &str) -> String {
        self.state
            .branches
            .get(branch)
            .map(|msgs| {
                msgs.iter()
                    .map(|m| format!("{}:\n{}", m.role.as_str().to_uppercase(), m.content))
                    .collect::<Vec<_>>()
                    .join("\n\n")
            })
            .unwrap_or_default()
    }

    /// Upsert a task record (keyed by task id) in the resumption metadata.
    pub fn record_task(&mut self, record: TaskRecord) -> Result<()> {
        match self
            .state
            .tasks
            .iter_mut()
            .find(|t| t.task_id == record.task_id)
        {
            Some(existing) => *existing = record,
            None => self.state.tasks.push(record),
        }
        self.persist()
    }

    pub fn tasks(&self) -> &[TaskRecord] {
        &self.state.tasks
    }

    fn persist(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.state)
            .map_err(|e| BuildError::PersistenceFailure(format!("encoding state: {e}")))?;
        let tmp = self.state_path.with_extension("tmp");
        fs::write(&tmp, bytes)
            .map_err(|e| BuildError::PersistenceFailure(format!("writing {tmp:?}: {e}")))?;
        fs::rename(&tmp, &self.state_path).map_err(|e| {
            BuildError::PersistenceFailure(format!("replacing {:?}: {e}", self.state_path))
        })?;
        Ok(())
    }
}

fn next_seq(messages: &[Message]) -> u64 {
    messages.iter().map(|m| m.seq).max().unwrap_or(0) + 1
}

/// Evict oldest non-system messages until the window bound holds. The
/// leading system framing message survives every trim.
fn trim_window(messages: &mut Vec<Message>, max_len: usize) {
    while messages.len() > max_len {
        let Some(oldest) = messages.iter().position(|m| m.role != Role::System) else {
            break;
        };
        messages.remove(oldest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildloop_core::TaskState;
    use uuid::Uuid;

    fn store_in(dir: &Path, max_len: usize) -> ConversationStore {
        let cfg = StoreConfig {
            max_conversation_length: max_len,
            state_file: "conversation_state.json".to_string(),
        };
        ConversationStore::open(dir, &cfg, "system framing").expect("open store")
    }

    #[test]
    fn load_seeds_system_message() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), 10);
        let msgs = store.load("root").expect("load");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[0].content, "system framing");
    }

    #[test]
    fn append_assigns_increasing_seq() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), 10);
        store.append("root", Role::User, "one").expect("append");
        store.append("root", Role::Assistant, "two").expect("append");
        let msgs = store.load("root").expect("load");
        let seqs: Vec<u64> = msgs.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn window_bound_holds_across_any_append_sequence() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), 5);
        for i in 0..40 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store
                .append("root", role, format!("message {i}"))
                .expect("append");
            let msgs = store.load("root").expect("load");
            assert!(msgs.len() <= 5, "window exceeded at append {i}");
            assert_eq!(msgs[0].role, Role::System, "system evicted at append {i}");
        }
        let msgs = store.load("root").expect("load");
        // Newest messages survive.
        assert_eq!(msgs.last().expect("last").content, "message 39");
    }

    #[test]
    fn trim_keeps_system_even_at_tiny_bounds() {
        let mut messages = vec![
            Message::new(Role::System, "framing", 1),
            Message::new(Role::User, "a", 2),
            Message::new(Role::User, "b", 3),
        ];
        trim_window(&mut messages, 1);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::System);
    }

    #[test]
    fn fork_copies_parent_transcript() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), 10);
        store.append("root", Role::User, "hello").expect("append");
        let child = store.fork("root").expect("fork");
        assert_eq!(child, "root/q1");
        let parent_msgs: Vec<Message> = store.load("root").expect("load").to_vec();
        let child_msgs: Vec<Message> = store.load(&child).expect("load").to_vec();
        assert_eq!(parent_msgs, child_msgs);
    }

    #[test]
    fn fork_names_do_not_collide() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), 10);
        let a = store.fork("root").expect("fork");
        let b = store.fork("root").expect("fork");
        assert_ne!(a, b);
        assert_eq!(b, "root/q2");
    }

    #[test]
    fn fork_then_merge_without_appends_is_identity() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), 10);
        store.append("root", Role::User, "context").expect("append");
        let before: Vec<Message> = store.load("root").expect("load").to_vec();
        let child = store.fork("root").expect("fork");
        store.merge(&child, "root").expect("merge");
        let after: Vec<Message> = store.load("root").expect("load").to_vec();
        assert_eq!(before, after);
    }

    #[test]
    fn merge_appends_child_tail_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), 10);
        store.append("root", Role::User, "context").expect("append");
        let child = store.fork("root").expect("fork");
        store
            .append(&child, Role::User, "clarifying answer")
            .expect("append");
        store
            .append(&child, Role::Assistant, "acknowledged")
            .expect("append");
        store.merge(&child, "root").expect("merge");
        let msgs = store.load("root").expect("load");
        let contents: Vec<&str> = msgs.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec![
                "system framing",
                "context",
                "clarifying answer",
                "acknowledged"
            ]
        );
        // Seq numbers stay strictly increasing after the merge.
        let seqs: Vec<u64> = msgs.iter().map(|m| m.seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn merge_requires_matching_fork_point() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), 10);
        assert!(store.merge("root/q1", "root").is_err());
        let child = store.fork("root").expect("fork");
        assert!(store.merge(&child, "elsewhere").is_err());
    }

    #[test]
    fn merge_twice_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), 10);
        let child = store.fork("root").expect("fork");
        store.merge(&child, "root").expect("merge");
        assert!(store.merge(&child, "root").is_err());
    }

    #[test]
    fn flattened_uppercases_roles_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), 10);
        store.append("root", Role::User, "hello there").expect("append");
        store.append("root", Role::Assistant, "hi").expect("append");
        let flat = store.flattened("root");
        assert!(flat.contains("SYSTEM:\nsystem framing"));
        assert!(flat.contains("USER:\nhello there"));
        assert!(flat.contains("ASSISTANT:\nhi"));
        assert!(flat.find("USER:").expect("user") < flat.find("ASSISTANT:").expect("assistant"));
    }

    #[test]
    fn state_survives_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        {
            let mut store = store_in(temp.path(), 10);
            store.append("root", Role::User, "persisted").expect("append");
            let child = store.fork("root").expect("fork");
            store
                .append(&child, Role::User, "child message")
                .expect("append");
        }
        let mut store = store_in(temp.path(), 10);
        let msgs = store.load("root").expect("load");
        assert_eq!(msgs.len(), 2);
        assert!(store.has_branch("root/q1"));
        let child_msgs = store.load("root/q1").expect("load");
        assert_eq!(child_msgs.last().expect("last").content, "child message");
    }

    #[test]
    fn task_records_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let task_id = Uuid::now_v7();
        {
            let mut store = store_in(temp.path(), 10);
            store
                .record_task(TaskRecord {
                    task_id,
                    branch: "root".to_string(),
                    depth: 0,
                    parent: None,
                    state: TaskState::Drafting,
                })
                .expect("record");
            store
                .record_task(TaskRecord {
                    task_id,
                    branch: "root".to_string(),
                    depth: 0,
                    parent: None,
                    state: TaskState::Complete,
                })
                .expect("update");
        }
        let store = store_in(temp.path(), 10);
        assert_eq!(store.tasks().len(), 1);
        assert_eq!(store.tasks()[0].state, TaskState::Complete);
    }

    #[test]
    fn persistence_leaves_no_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), 10);
        store.append("root", Role::User, "x").expect("append");
        let dir = runtime_dir(temp.path());
        let leftovers: Vec<_> = fs::read_dir(dir)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn reset_clears_everything() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), 10);
        store.append("root", Role::User, "x").expect("append");
        store.reset().expect("reset");
        assert!(!store.has_branch("root"));
        assert!(store.tasks().is_empty());
    }
}
