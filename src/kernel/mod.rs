//! Task scheduler and dispatcher.
//!
//! The kernel owns every [`Task`] and a strict FIFO queue of pending ids.
//! One scheduling step ([`Kernel::tick`]) takes the oldest pending task,
//! resolves its agent, logs `STARTED`, runs the agent, logs the outcome and
//! only then updates the task's status. A status change is never visible
//! before its ledger entry is durable; when an append fails the outcome is
//! parked as uncommitted and retried before any new work is dequeued.
//!
//! Tasks submitted while an agent runs (delegation) go to the back of the
//! queue, so a task tree expands breadth-first and the ledger stays a linear
//! trace of what ran when.

mod worker;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RuntimeError};
use crate::ledger::{EntryMetrics, LedgerEventKind, NewEntry, SharedLedger};
use crate::registry::{AgentContext, AgentRegistry, ToolRegistry};
use crate::task::{NewTask, Task, TaskId, TaskStatus};

/// Actor recorded for submissions that did not come from an agent.
pub const KERNEL_ACTOR: &str = "kernel";

/// What one scheduling step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub task_id: TaskId,
    pub agent_id: String,
    pub status: TaskStatus,
}

/// An agent result whose terminal ledger entry has not been written yet.
#[derive(Debug, Clone)]
struct Outcome {
    task_id: TaskId,
    actor: String,
    result: std::result::Result<Value, String>,
    metrics: EntryMetrics,
}

#[derive(Default)]
struct KernelState {
    tasks: HashMap<TaskId, Task>,
    queue: VecDeque<TaskId>,
    running: HashMap<TaskId, CancellationToken>,
    uncommitted: Vec<Outcome>,
    /// `DELEGATED` entries for children that are already submitted.
    unlinked: Vec<NewEntry>,
}

pub struct Kernel {
    agents: Arc<AgentRegistry>,
    tools: Arc<ToolRegistry>,
    ledger: SharedLedger,
    state: Mutex<KernelState>,
    /// Signalled on every submission; idle workers wait on it.
    work: Notify,
    /// Signalled whenever a task reaches a terminal status.
    progress: Notify,
}

impl Kernel {
    pub fn new(agents: Arc<AgentRegistry>, tools: Arc<ToolRegistry>, ledger: SharedLedger) -> Self {
        Self {
            agents,
            tools,
            ledger,
            state: Mutex::new(KernelState::default()),
            work: Notify::new(),
            progress: Notify::new(),
        }
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    /// Enqueue a new task and return its id.
    ///
    /// The agent id must be registered; the task only exists once its
    /// `SUBMITTED` entry is durable.
    pub async fn submit(&self, request: NewTask) -> Result<TaskId> {
        let task = Task::new(request)?;
        self.agents.registration(task.agent_id())?;

        let mut state = self.state.lock().await;
        self.flush_unlinked(&mut state).await?;
        let entry = NewEntry::new(task.id(), LedgerEventKind::Submitted, KERNEL_ACTOR)
            .with_payload(task.payload())
            .with_summary(format!("submitted to {}", task.agent_id()));
        let sequence = self.ledger.append(entry).await?;

        let task_id = task.id();
        tracing::debug!(task_id = %task_id, agent = %task.agent_id(), sequence, "Task submitted");
        state.queue.push_back(task_id);
        state.tasks.insert(task_id, task);
        drop(state);

        self.work.notify_one();
        Ok(task_id)
    }

    /// Enqueue a task on behalf of a running parent task.
    ///
    /// Writes `SUBMITTED` for the child, then `DELEGATED` against the parent.
    /// If only the second append fails, the child still exists and the link
    /// is held back; it is written before anything else reaches the ledger.
    pub async fn submit_delegated(&self, parent_id: TaskId, request: NewTask) -> Result<TaskId> {
        let task = Task::new(request.with_parent(parent_id))?;
        self.agents.registration(task.agent_id())?;

        let mut state = self.state.lock().await;
        let parent_agent = state
            .tasks
            .get(&parent_id)
            .map(|p| p.agent_id().to_string())
            .ok_or_else(|| task_not_found(parent_id))?;

        self.flush_unlinked(&mut state).await?;

        let submitted = NewEntry::new(task.id(), LedgerEventKind::Submitted, parent_agent.as_str())
            .with_payload(task.payload())
            .with_summary(format!("submitted to {} by {}", task.agent_id(), parent_id));
        let sequence = self.ledger.append(submitted).await?;

        let delegated = NewEntry::new(parent_id, LedgerEventKind::Delegated, parent_agent.as_str())
            .with_payload(task.payload())
            .with_summary(format!("delegated {} to {}", task.id(), task.agent_id()));
        if let Err(e) = self.ledger.append(delegated.clone()).await {
            tracing::warn!(
                task_id = %task.id(),
                parent = %parent_id,
                "Delegation link not recorded, will retry: {}",
                e
            );
            state.unlinked.push(delegated);
        }

        let task_id = task.id();
        tracing::info!(
            task_id = %task_id,
            parent = %parent_id,
            agent = %task.agent_id(),
            sequence,
            "Task delegated"
        );
        state.queue.push_back(task_id);
        state.tasks.insert(task_id, task);
        drop(state);

        self.work.notify_one();
        Ok(task_id)
    }

    /// Run one scheduling step.
    ///
    /// Returns `Ok(None)` when the queue is empty. A ledger failure is
    /// returned as `StoreUnavailable`; the task involved keeps its previous
    /// status and is picked up again by the next call.
    pub async fn tick(&self) -> Result<Option<TickReport>> {
        self.commit_pending().await?;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(task_id) = state.queue.pop_front() else {
            return Ok(None);
        };
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Err(RuntimeError::internal(format!("queued task {} has no record", task_id)));
        };
        let agent_id = task.agent_id().to_string();

        if task.is_cancelling() {
            let entry = NewEntry::new(task_id, LedgerEventKind::Cancelled, KERNEL_ACTOR)
                .with_summary("cancelled before start");
            if let Err(e) = self.ledger.append(entry).await {
                state.queue.push_front(task_id);
                return Err(e.into());
            }
            task.cancel()?;
            tracing::info!(task_id = %task_id, agent = %agent_id, "Task cancelled before start");
            let status = task.status().clone();
            drop(guard);
            self.progress.notify_waiters();
            return Ok(Some(TickReport {
                task_id,
                agent_id,
                status,
            }));
        }

        let resolved = self.agents.resolve(&agent_id);

        let entry = NewEntry::new(task_id, LedgerEventKind::Started, agent_id.as_str())
            .with_payload(task.payload());
        if let Err(e) = self.ledger.append(entry).await {
            tracing::error!(task_id = %task_id, "Failed to record task start: {}", e);
            state.queue.push_front(task_id);
            return Err(e.into());
        }
        task.start()?;
        let payload = task.payload().clone();
        let parent_id = task.parent_id();
        let cancel = CancellationToken::new();
        state.running.insert(task_id, cancel.clone());
        drop(guard);

        tracing::info!(task_id = %task_id, agent = %agent_id, "Task started");
        let started = Instant::now();
        let ctx = AgentContext::new(task_id, agent_id.clone(), parent_id, cancel, self.tools.clone());
        let result = match resolved {
            Ok(agent) => agent.execute(&ctx, payload).await.map_err(|e| e.to_string()),
            Err(e) => Err(RuntimeError::from(e).to_string()),
        };
        let outcome = Outcome {
            task_id,
            actor: agent_id.clone(),
            result,
            metrics: EntryMetrics {
                latency_ms: Some(started.elapsed().as_millis() as u64),
                cost_cents: None,
                provider: ctx.provider(),
            },
        };

        let mut state = self.state.lock().await;
        state.running.remove(&task_id);
        let status = self.commit(&mut state, outcome).await?;
        drop(state);

        self.progress.notify_waiters();
        Ok(Some(TickReport {
            task_id,
            agent_id,
            status,
        }))
    }

    /// Retry entries whose append failed earlier: delegation links first,
    /// then terminal outcomes.
    ///
    /// Returns how many outcomes were committed.
    pub async fn commit_pending(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        self.flush_unlinked(&mut state).await?;
        if state.uncommitted.is_empty() {
            return Ok(0);
        }
        let pending = std::mem::take(&mut state.uncommitted);
        let mut committed = 0;
        let mut remaining = pending.into_iter();
        while let Some(outcome) = remaining.next() {
            if let Err(e) = self.commit(&mut state, outcome).await {
                state.uncommitted.extend(remaining);
                return Err(e);
            }
            committed += 1;
        }
        drop(state);

        tracing::info!(committed, "Committed pending outcomes");
        self.progress.notify_waiters();
        Ok(committed)
    }

    /// Write held-back `DELEGATED` entries, oldest first.
    async fn flush_unlinked(&self, state: &mut KernelState) -> Result<()> {
        while let Some(entry) = state.unlinked.first().cloned() {
            self.ledger.append(entry).await?;
            state.unlinked.remove(0);
        }
        Ok(())
    }

    async fn commit(&self, state: &mut KernelState, outcome: Outcome) -> Result<TaskStatus> {
        if let Err(e) = self.flush_unlinked(state).await {
            state.uncommitted.push(outcome);
            return Err(e);
        }
        let entry = match &outcome.result {
            Ok(output) => NewEntry::new(outcome.task_id, LedgerEventKind::Completed, outcome.actor.as_str())
                .with_payload(output),
            Err(reason) => NewEntry::new(outcome.task_id, LedgerEventKind::Failed, outcome.actor.as_str())
                .with_payload(&json!({ "error": reason }))
                .with_summary(reason),
        }
        .with_metrics(outcome.metrics.clone());

        match self.ledger.append(entry).await {
            Ok(sequence) => {
                let task = state
                    .tasks
                    .get_mut(&outcome.task_id)
                    .ok_or_else(|| task_not_found(outcome.task_id))?;
                match outcome.result {
                    Ok(output) => task.succeed(output)?,
                    Err(reason) => task.fail(reason)?,
                }
                tracing::info!(
                    task_id = %outcome.task_id,
                    agent = %outcome.actor,
                    status = %task.status(),
                    sequence,
                    latency_ms = outcome.metrics.latency_ms.unwrap_or(0),
                    "Task finished"
                );
                Ok(task.status().clone())
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %outcome.task_id,
                    "Outcome not committed, will retry: {}",
                    e
                );
                state.uncommitted.push(outcome);
                Err(e.into())
            }
        }
    }

    /// Tick until `task_id` is terminal and return its final state.
    pub async fn run_to_completion(&self, task_id: TaskId) -> Result<Task> {
        loop {
            let notified = self.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock().await;
                let task = state.tasks.get(&task_id).ok_or_else(|| task_not_found(task_id))?;
                if task.status().is_terminal() {
                    return Ok(task.clone());
                }
            }

            if self.tick().await?.is_none() {
                // Someone else (a worker) is running it.
                notified.await;
            }
        }
    }

    /// Tick until `root` and everything it transitively delegated are
    /// terminal. Returns the whole tree, root first, in creation order.
    pub async fn run_tree(&self, root: TaskId) -> Result<Vec<Task>> {
        loop {
            let notified = self.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock().await;
                let tree = collect_tree(&state.tasks, root)?;
                if tree.iter().all(|t| t.status().is_terminal()) {
                    return Ok(tree);
                }
            }

            if self.tick().await?.is_none() {
                notified.await;
            }
        }
    }

    /// Tick until the queue is empty.
    pub async fn run_until_idle(&self) -> Result<Vec<TickReport>> {
        let mut reports = Vec::new();
        while let Some(report) = self.tick().await? {
            reports.push(report);
        }
        Ok(reports)
    }

    /// Ask a task to stop.
    ///
    /// A pending task is cancelled at its next scheduling point without
    /// running. A running task has its cancellation token fired and finishes
    /// however its agent decides. Returns `false` if the task already finished.
    pub async fn cancel(&self, task_id: TaskId) -> Result<bool> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| task_not_found(task_id))?;
        if !task.request_cancel() {
            return Ok(false);
        }
        if let Some(token) = state.running.get(&task_id) {
            token.cancel();
        }
        tracing::info!(task_id = %task_id, status = %task.status(), "Cancellation requested");
        Ok(true)
    }

    pub async fn task(&self, task_id: TaskId) -> Option<Task> {
        self.state.lock().await.tasks.get(&task_id).cloned()
    }

    /// Every task the kernel knows about, oldest first.
    pub async fn tasks(&self) -> Vec<Task> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| (t.created_at(), t.id()));
        tasks
    }

    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Outcomes and delegation links still waiting for the ledger.
    pub async fn uncommitted_len(&self) -> usize {
        let state = self.state.lock().await;
        state.uncommitted.len() + state.unlinked.len()
    }
}

fn task_not_found(task_id: TaskId) -> RuntimeError {
    RuntimeError::NotFound {
        kind: "task",
        id: task_id.to_string(),
        known: Vec::new(),
    }
}

fn collect_tree(tasks: &HashMap<TaskId, Task>, root: TaskId) -> Result<Vec<Task>> {
    let root_task = tasks.get(&root).ok_or_else(|| task_not_found(root))?;

    let mut children: HashMap<TaskId, Vec<&Task>> = HashMap::new();
    for task in tasks.values() {
        if let Some(parent) = task.parent_id() {
            children.entry(parent).or_default().push(task);
        }
    }

    let mut seen = HashSet::from([root]);
    let mut frontier = vec![root];
    let mut descendants = Vec::new();
    while let Some(id) = frontier.pop() {
        for child in children.get(&id).into_iter().flatten() {
            if seen.insert(child.id()) {
                frontier.push(child.id());
                descendants.push((*child).clone());
            }
        }
    }
    descendants.sort_by_key(|t| (t.created_at(), t.id()));

    let mut tree = Vec::with_capacity(descendants.len() + 1);
    tree.push(root_task.clone());
    tree.extend(descendants);
    Ok(tree)
}

#[cfg(test)]
mod tests;
