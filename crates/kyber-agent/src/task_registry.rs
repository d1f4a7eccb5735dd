//! TaskRegistry — in-memory + append-only JSONL log of background task
//! lifecycle, with reference-token lookup.
//!
//! The registry is the single owner and mutator of `Task` records. Every
//! terminal transition (`mark_completed`/`mark_failed`/`mark_cancelled`) is
//! appended to a durable history log so tasks survive a process restart —
//! the rest of the agent (`AgentCore`, `GatewayAPI`) only ever reaches a
//! `Task` through this registry's methods.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use kyber_core::utils::timestamp;

/// Maximum history entries hydrated from the log file on startup.
const HYDRATE_LIMIT: usize = 200;

/// Cap on `result` length persisted to the history log (not the in-memory copy).
const LOGGED_RESULT_CHARS: usize = 200_000;

/// A task's place in its lifecycle. Terminal states are sticky — see
/// `TaskRegistry`'s invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// A background task tracked by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub reference: String,
    pub description: String,
    pub label: String,
    pub status: TaskStatus,
    pub origin_channel: String,
    pub origin_chat_id: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub iteration: u32,
    pub max_iterations: Option<u32>,
    pub current_action: Option<String>,
    pub actions_completed: Vec<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub completion_reference: Option<String>,
}

impl Task {
    fn new(id: String, description: String, label: String, origin_channel: String, origin_chat_id: String) -> Self {
        Task {
            reference: format!("⚡{id}"),
            id,
            description,
            label,
            status: TaskStatus::Queued,
            origin_channel,
            origin_chat_id,
            created_at: timestamp(),
            started_at: None,
            completed_at: None,
            iteration: 0,
            max_iterations: None,
            current_action: None,
            actions_completed: Vec::new(),
            result: None,
            error: None,
            completion_reference: None,
        }
    }

    /// Copy of `self` with `result` capped for durable storage.
    fn for_log(&self) -> Task {
        let mut t = self.clone();
        if let Some(r) = &t.result {
            if r.chars().count() > LOGGED_RESULT_CHARS {
                t.result = Some(r.chars().take(LOGGED_RESULT_CHARS).collect());
            }
        }
        t
    }
}

/// Strip a leading reference-prefix emoji (`⚡`/`✅`/`❌`), if present.
fn strip_ref_prefix(s: &str) -> &str {
    s.strip_prefix('⚡')
        .or_else(|| s.strip_prefix('✅'))
        .or_else(|| s.strip_prefix('❌'))
        .unwrap_or(s)
}

fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:08x}", rng.gen::<u32>())
}

fn normalize(s: &str) -> String {
    s.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Longest common subsequence ratio on normalized text: `2*lcs / (len_a + len_b)`.
fn lcs_ratio(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    let ac: Vec<char> = a.chars().collect();
    let bc: Vec<char> = b.chars().collect();
    if ac.is_empty() && bc.is_empty() {
        return 1.0;
    }
    if ac.is_empty() || bc.is_empty() {
        return 0.0;
    }

    let mut prev = vec![0usize; bc.len() + 1];
    let mut curr = vec![0usize; bc.len() + 1];
    for ai in &ac {
        for (j, bj) in bc.iter().enumerate() {
            curr[j + 1] = if ai == bj {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    let lcs_len = prev[bc.len()];

    2.0 * lcs_len as f64 / (ac.len() + bc.len()) as f64
}

/// In-memory task store, backed by an append-only JSONL history log.
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Task>>,
    history_path: PathBuf,
    log_lock: Mutex<()>,
}

impl TaskRegistry {
    /// Create a registry rooted at `data_dir` (history log lives at
    /// `<data_dir>/tasks/history.jsonl`) and hydrate up to the last
    /// `HYDRATE_LIMIT` terminal entries from disk.
    pub async fn new(data_dir: PathBuf) -> anyhow::Result<Self> {
        let tasks_dir = data_dir.join("tasks");
        tokio::fs::create_dir_all(&tasks_dir).await?;
        let history_path = tasks_dir.join("history.jsonl");

        let registry = TaskRegistry {
            tasks: RwLock::new(HashMap::new()),
            history_path,
            log_lock: Mutex::new(()),
        };
        registry.hydrate().await?;
        Ok(registry)
    }

    async fn hydrate(&self) -> anyhow::Result<()> {
        let contents = match tokio::fs::read_to_string(&self.history_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
        let tail = if lines.len() > HYDRATE_LIMIT {
            &lines[lines.len() - HYDRATE_LIMIT..]
        } else {
            &lines[..]
        };

        let mut tasks = self.tasks.write().await;
        for line in tail {
            match serde_json::from_str::<Task>(line) {
                Ok(task) => {
                    tasks.insert(task.id.clone(), task);
                }
                Err(e) => warn!(error = %e, "skipping malformed task history line"),
            }
        }
        debug!(hydrated = tasks.len(), "task registry hydrated from history log");
        Ok(())
    }

    /// Create a new task in `queued` state.
    pub async fn create(
        &self,
        description: impl Into<String>,
        label: impl Into<String>,
        origin_channel: impl Into<String>,
        origin_chat_id: impl Into<String>,
    ) -> Task {
        let id = generate_id();
        let task = Task::new(id.clone(), description.into(), label.into(), origin_channel.into(), origin_chat_id.into());
        self.tasks.write().await.insert(id, task.clone());
        task
    }

    /// Look up a task by its raw `id`.
    pub async fn get(&self, id: &str) -> Option<Task> {
        self.tasks.read().await.get(id).cloned()
    }

    /// Look up a task by `reference`, `completion_reference`, or bare id.
    pub async fn get_by_ref(&self, reference: &str) -> Option<Task> {
        let id = strip_ref_prefix(reference);
        self.get(id).await
    }

    /// Transition a task to `running`. No-op if already terminal.
    pub async fn mark_started(&self, id: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            if task.status.is_terminal() {
                return;
            }
            task.status = TaskStatus::Running;
            task.started_at = Some(timestamp());
        }
    }

    /// Update the in-progress task's step counter, current action, and
    /// completed-action log. No-op if the task is already terminal.
    pub async fn update_progress(&self, id: &str, current_action: impl Into<String>, completed_action: Option<String>) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            if task.status.is_terminal() {
                return;
            }
            task.iteration += 1;
            task.current_action = Some(current_action.into());
            if let Some(action) = completed_action {
                task.actions_completed.push(action);
            }
        }
    }

    async fn finalize(&self, id: &str, status: TaskStatus, result: Option<String>, error: Option<String>) {
        let prefix = if status == TaskStatus::Completed { '✅' } else { '❌' };

        let finished = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(id) {
                Some(task) => {
                    // Cancellation wins races: once cancelled, completed/failed
                    // transitions arriving afterward are no-ops.
                    if task.status.is_terminal() {
                        return;
                    }
                    task.status = status;
                    task.completed_at = Some(timestamp());
                    task.result = result;
                    task.error = error;
                    task.completion_reference = Some(format!("{prefix}{id}"));
                    task.clone()
                }
                None => return,
            }
        };

        self.append_to_log(&finished).await;
    }

    /// Transition a task to `completed`. No-op (sticky) if already terminal.
    pub async fn mark_completed(&self, id: &str, result: impl Into<String>) {
        self.finalize(id, TaskStatus::Completed, Some(result.into()), None).await;
    }

    /// Transition a task to `failed`. No-op (sticky) if already terminal.
    pub async fn mark_failed(&self, id: &str, error: impl Into<String>) {
        self.finalize(id, TaskStatus::Failed, None, Some(error.into())).await;
    }

    /// Transition a task to `cancelled`. Wins races against a concurrent
    /// `mark_completed`/`mark_failed` for the same task.
    pub async fn mark_cancelled(&self, id: &str) {
        self.finalize(id, TaskStatus::Cancelled, None, None).await;
    }

    async fn append_to_log(&self, task: &Task) {
        let line = match serde_json::to_string(&task.for_log()) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, task_id = %task.id, "failed to serialize task for history log");
                return;
            }
        };

        let _guard = self.log_lock.lock().await;
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.history_path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = result {
            warn!(error = %e, task_id = %task.id, "failed to append task to history log");
        }
    }

    /// All tasks currently `queued` or `running`.
    pub async fn get_active_tasks(&self) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut active: Vec<Task> = tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        active
    }

    /// Up to `limit` most-recently-completed tasks, newest first.
    pub async fn get_history(&self, limit: usize) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut history: Vec<Task> = tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .cloned()
            .collect();
        history.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        history.truncate(limit);
        history
    }

    /// Find an active task from the same origin whose label/description
    /// are similar enough to be considered a duplicate request.
    pub async fn find_active_duplicate(
        &self,
        label: &str,
        description: &str,
        origin_channel: &str,
        origin_chat_id: &str,
    ) -> Option<Task> {
        let tasks = self.tasks.read().await;
        tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .filter(|t| t.origin_channel == origin_channel && t.origin_chat_id == origin_chat_id)
            .find(|t| {
                let label_sim = lcs_ratio(&t.label, label);
                if label_sim < 0.75 {
                    return false;
                }
                let desc_sim = lcs_ratio(&t.description, description);
                if desc_sim >= 0.9 {
                    return true;
                }
                if description.chars().count() > 40 {
                    let a = normalize(&t.description);
                    let b = normalize(description);
                    return a.contains(&b) || b.contains(&a);
                }
                false
            })
            .cloned()
    }

    /// Path to the durable history log, for diagnostics.
    pub fn history_path(&self) -> &Path {
        &self.history_path
    }

    /// Render the active-tasks block `ContextBuilder` injects into the
    /// system prompt. Empty string when nothing is running.
    pub async fn get_context_summary(&self) -> String {
        let active = self.get_active_tasks().await;
        active
            .iter()
            .map(|t| {
                let action = t.current_action.as_deref().unwrap_or("starting up");
                format!("- {} ({}): {} — iteration {}", t.reference, t.label, action, t.iteration)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Human-readable one-line status for a `task_status` tool lookup,
    /// accepting the same prefixed/bare reference forms as `get_by_ref`.
    pub async fn get_status_for_ref(&self, reference: &str) -> Option<String> {
        let task = self.get_by_ref(reference).await?;
        Some(match task.status {
            TaskStatus::Queued => format!("{} is queued.", task.reference),
            TaskStatus::Running => format!(
                "{} is running: {} (iteration {}).",
                task.reference,
                task.current_action.as_deref().unwrap_or("working"),
                task.iteration
            ),
            TaskStatus::Completed => format!(
                "{} completed: {}",
                task.completion_reference.as_deref().unwrap_or(&task.reference),
                task.result.as_deref().unwrap_or("(no result)")
            ),
            TaskStatus::Failed => format!(
                "{} failed: {}",
                task.completion_reference.as_deref().unwrap_or(&task.reference),
                task.error.as_deref().unwrap_or("(no error message)")
            ),
            TaskStatus::Cancelled => {
                format!("{} was cancelled.", task.completion_reference.as_deref().unwrap_or(&task.reference))
            }
        })
    }
}
