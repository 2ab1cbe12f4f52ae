use super::*;
use crate::ledger::{InMemoryLedger, Ledger, LedgerEntry};
use crate::registry::tests::static_registration;
use crate::registry::{Agent, AgentRegistration, AgentRole};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Weak;

/// Agent that submits one child per entry in `payload.children`.
struct FanOut {
    kernel: Weak<Kernel>,
}

#[async_trait]
impl Agent for FanOut {
    fn id(&self) -> &str {
        "fanout"
    }

    async fn execute(&self, ctx: &AgentContext, payload: Value) -> Result<Value> {
        let kernel = self
            .kernel
            .upgrade()
            .ok_or_else(|| RuntimeError::internal("kernel dropped"))?;
        let mut spawned = Vec::new();
        for child in payload["children"].as_array().cloned().unwrap_or_default() {
            let agent = child["agent"].as_str().unwrap_or_default().to_string();
            let id = kernel
                .submit_delegated(ctx.task_id, NewTask::new(agent, child["payload"].clone()))
                .await?;
            spawned.push(id.to_string());
        }
        Ok(json!({ "spawned": spawned }))
    }
}

struct Counting {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Agent for Counting {
    fn id(&self) -> &str {
        "counting"
    }

    async fn execute(&self, _ctx: &AgentContext, _payload: Value) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "ok": true }))
    }
}

struct Failing;

#[async_trait]
impl Agent for Failing {
    fn id(&self) -> &str {
        "failing"
    }

    async fn execute(&self, _ctx: &AgentContext, _payload: Value) -> Result<Value> {
        Err(RuntimeError::validation("payload missing 'objective'"))
    }
}

/// Takes the ledger offline while running, so its own outcome cannot commit.
struct Saboteur {
    ledger: Arc<InMemoryLedger>,
}

#[async_trait]
impl Agent for Saboteur {
    fn id(&self) -> &str {
        "saboteur"
    }

    async fn execute(&self, _ctx: &AgentContext, _payload: Value) -> Result<Value> {
        self.ledger.set_available(false);
        Ok(json!({ "done": true }))
    }
}

/// Waits for cancellation after announcing that it started.
struct Patient {
    started: Arc<Notify>,
}

#[async_trait]
impl Agent for Patient {
    fn id(&self) -> &str {
        "patient"
    }

    async fn execute(&self, ctx: &AgentContext, _payload: Value) -> Result<Value> {
        self.started.notify_one();
        ctx.cancel_token().cancelled().await;
        Err(RuntimeError::Cancelled("stopped on request".to_string()))
    }
}

fn registration<A: Agent + 'static>(
    id: &str,
    make: impl Fn() -> A + Send + Sync + 'static,
) -> AgentRegistration {
    AgentRegistration::new(
        id,
        AgentRole::Specialist,
        Arc::new(move || Arc::new(make()) as Arc<dyn Agent>),
    )
}

struct Harness {
    kernel: Arc<Kernel>,
    ledger: Arc<InMemoryLedger>,
    calls: Arc<AtomicUsize>,
    started: Arc<Notify>,
}

fn harness() -> Harness {
    let ledger = Arc::new(InMemoryLedger::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(Notify::new());

    Harness {
        kernel: Arc::new_cyclic(|weak: &Weak<Kernel>| {
            let mut agents = AgentRegistry::new();
            agents.register(static_registration(
                "specialist-planning",
                json!({ "plan": ["a", "b"] }),
            ));
            let kernel = weak.clone();
            agents.register(registration("fanout", move || FanOut {
                kernel: kernel.clone(),
            }));
            let counter = calls.clone();
            agents.register(registration("counting", move || Counting {
                calls: counter.clone(),
            }));
            agents.register(registration("failing", || Failing));
            let saboteur_ledger = ledger.clone();
            agents.register(registration("saboteur", move || Saboteur {
                ledger: saboteur_ledger.clone(),
            }));
            let signal = started.clone();
            agents.register(registration("patient", move || Patient {
                started: signal.clone(),
            }));

            let shared: SharedLedger = ledger.clone();
            Kernel::new(Arc::new(agents), Arc::new(ToolRegistry::new()), shared)
        }),
        ledger,
        calls,
        started,
    }
}

fn kinds(entries: &[LedgerEntry]) -> Vec<LedgerEventKind> {
    entries.iter().map(|e| e.kind).collect()
}

#[tokio::test]
async fn submitted_task_runs_and_is_logged_in_order() {
    let h = harness();
    let id = h
        .kernel
        .submit(NewTask::new("specialist-planning", json!({ "mission_id": 1 })))
        .await
        .unwrap();
    assert!(h.kernel.agents().resolve("specialist-planning").is_ok());

    let task = h.kernel.run_to_completion(id).await.unwrap();
    assert_eq!(task.status(), &TaskStatus::Succeeded);
    assert_eq!(task.output(), Some(&json!({ "plan": ["a", "b"] })));

    let entries = h.ledger.entries_for(id).await.unwrap();
    assert_eq!(
        kinds(&entries),
        vec![
            LedgerEventKind::Submitted,
            LedgerEventKind::Started,
            LedgerEventKind::Completed
        ]
    );
    assert_eq!(entries[1].actor, "specialist-planning");
    assert!(entries[2].metrics.as_ref().and_then(|m| m.latency_ms).is_some());
}

#[tokio::test]
async fn unknown_agent_is_rejected_without_ledger_entries() {
    let h = harness();
    let err = h
        .kernel
        .submit(NewTask::new("nonexistent", json!({})))
        .await
        .unwrap_err();
    match err {
        RuntimeError::NotFound { id, known, .. } => {
            assert_eq!(id, "nonexistent");
            assert!(known.contains(&"specialist-planning".to_string()));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.ledger.head().await.unwrap(), 0);
    assert!(h.kernel.tasks().await.is_empty());
}

#[tokio::test]
async fn queue_is_fifo() {
    let h = harness();
    let first = h.kernel.submit(NewTask::new("counting", json!(1))).await.unwrap();
    let second = h.kernel.submit(NewTask::new("failing", json!(2))).await.unwrap();
    let third = h.kernel.submit(NewTask::new("counting", json!(3))).await.unwrap();

    let order: Vec<TaskId> = h
        .kernel
        .run_until_idle()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.task_id)
        .collect();
    assert_eq!(order, vec![first, second, third]);
    assert_eq!(h.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn delegated_tasks_expand_breadth_first() {
    let h = harness();
    let root = h
        .kernel
        .submit(NewTask::new(
            "fanout",
            json!({
                "children": [
                    { "agent": "fanout", "payload": { "children": [ { "agent": "counting", "payload": {} } ] } },
                    { "agent": "specialist-planning", "payload": {} }
                ]
            }),
        ))
        .await
        .unwrap();

    let tree = h.kernel.run_tree(root).await.unwrap();
    assert_eq!(tree.len(), 4);
    assert_eq!(tree[0].id(), root);
    assert!(tree.iter().all(|t| t.status() == &TaskStatus::Succeeded));

    let started: Vec<String> = h
        .ledger
        .read_since(0)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == LedgerEventKind::Started)
        .map(|e| e.actor)
        .collect();
    // Root, then both children, then the grandchild.
    assert_eq!(
        started,
        vec!["fanout", "fanout", "specialist-planning", "counting"]
    );

    let root_entries = kinds(&h.ledger.entries_for(root).await.unwrap());
    assert_eq!(
        root_entries,
        vec![
            LedgerEventKind::Submitted,
            LedgerEventKind::Started,
            LedgerEventKind::Delegated,
            LedgerEventKind::Delegated,
            LedgerEventKind::Completed
        ]
    );
    for task in &tree[1..] {
        assert!(task.parent_id().is_some());
    }
}

#[tokio::test]
async fn agent_error_fails_only_that_task() {
    let h = harness();
    let bad = h.kernel.submit(NewTask::new("failing", json!({}))).await.unwrap();
    let good = h.kernel.submit(NewTask::new("counting", json!({}))).await.unwrap();
    h.kernel.run_until_idle().await.unwrap();

    let bad = h.kernel.task(bad).await.unwrap();
    match bad.status() {
        TaskStatus::Failed { reason } => assert!(reason.contains("objective")),
        other => panic!("unexpected status: {other}"),
    }
    assert_eq!(h.kernel.task(good).await.unwrap().status(), &TaskStatus::Succeeded);

    let last = h.ledger.latest_for(bad.id()).await.unwrap().unwrap();
    assert_eq!(last.kind, LedgerEventKind::Failed);
}

#[tokio::test]
async fn outcome_is_not_acknowledged_until_durable() {
    let h = harness();
    let id = h.kernel.submit(NewTask::new("saboteur", json!({}))).await.unwrap();

    let err = h.kernel.tick().await.unwrap_err();
    assert!(matches!(err, RuntimeError::StoreUnavailable(_)));
    assert_eq!(h.kernel.task(id).await.unwrap().status(), &TaskStatus::Running);
    assert_eq!(h.kernel.uncommitted_len().await, 1);

    // Still down: the retry fails the same way and nothing is lost.
    assert!(h.kernel.tick().await.is_err());
    assert_eq!(h.kernel.uncommitted_len().await, 1);

    h.ledger.set_available(true);
    assert!(h.kernel.tick().await.unwrap().is_none());
    assert_eq!(h.kernel.uncommitted_len().await, 0);
    assert_eq!(h.kernel.task(id).await.unwrap().status(), &TaskStatus::Succeeded);

    let all = h.ledger.read_since(0).await.unwrap();
    crate::ledger::verify_contiguous(&all).unwrap();
    assert_eq!(
        kinds(&all),
        vec![
            LedgerEventKind::Submitted,
            LedgerEventKind::Started,
            LedgerEventKind::Completed
        ]
    );
}

#[tokio::test]
async fn delegation_link_is_written_before_anything_else() {
    let h = harness();
    let root = h
        .kernel
        .submit(NewTask::new(
            "fanout",
            json!({ "children": [ { "agent": "counting", "payload": {} } ] }),
        ))
        .await
        .unwrap();

    // STARTED and the child's SUBMITTED go through; DELEGATED does not.
    h.ledger.fail_after_appends(2);
    let err = h.kernel.tick().await.unwrap_err();
    assert!(matches!(err, RuntimeError::StoreUnavailable(_)));
    assert_eq!(h.kernel.uncommitted_len().await, 2);
    assert_eq!(h.kernel.queue_len().await, 1);

    assert!(h.kernel.tick().await.is_err());
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);

    h.ledger.set_available(true);
    let tree = h.kernel.run_tree(root).await.unwrap();
    assert_eq!(tree.len(), 2);
    assert!(tree.iter().all(|t| t.status() == &TaskStatus::Succeeded));
    assert_eq!(h.kernel.uncommitted_len().await, 0);

    let all = h.ledger.read_since(0).await.unwrap();
    crate::ledger::verify_contiguous(&all).unwrap();
    assert_eq!(
        kinds(&all),
        vec![
            LedgerEventKind::Submitted,
            LedgerEventKind::Started,
            LedgerEventKind::Submitted,
            LedgerEventKind::Delegated,
            LedgerEventKind::Completed,
            LedgerEventKind::Started,
            LedgerEventKind::Completed
        ]
    );
    assert_eq!(all[3].task_id, root);
}

#[tokio::test]
async fn submit_fails_loudly_when_store_is_down() {
    let h = harness();
    h.ledger.set_available(false);
    let err = h
        .kernel
        .submit(NewTask::new("counting", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::StoreUnavailable(_)));
    assert_eq!(h.kernel.queue_len().await, 0);
}

#[tokio::test]
async fn cancelled_pending_task_never_runs() {
    let h = harness();
    let id = h.kernel.submit(NewTask::new("counting", json!({}))).await.unwrap();
    assert!(h.kernel.cancel(id).await.unwrap());

    let task = h.kernel.run_to_completion(id).await.unwrap();
    assert_eq!(task.status(), &TaskStatus::Cancelled);
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        kinds(&h.ledger.entries_for(id).await.unwrap()),
        vec![LedgerEventKind::Submitted, LedgerEventKind::Cancelled]
    );
    assert!(!h.kernel.cancel(id).await.unwrap());
}

#[tokio::test]
async fn running_task_sees_cancellation() {
    let h = harness();
    let id = h.kernel.submit(NewTask::new("patient", json!({}))).await.unwrap();

    let kernel = h.kernel.clone();
    let runner = tokio::spawn(async move { kernel.run_to_completion(id).await });

    h.started.notified().await;
    assert!(h.kernel.cancel(id).await.unwrap());

    let task = runner.await.unwrap().unwrap();
    assert!(matches!(task.status(), TaskStatus::Failed { .. }));
}

#[tokio::test]
async fn workers_drain_the_queue() {
    let h = harness();
    let shutdown = CancellationToken::new();
    let handles = h.kernel.spawn_workers(3, shutdown.clone());

    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(h.kernel.submit(NewTask::new("counting", json!(i))).await.unwrap());
    }
    for id in ids {
        let task = h.kernel.run_to_completion(id).await.unwrap();
        assert_eq!(task.status(), &TaskStatus::Succeeded);
    }
    assert_eq!(h.calls.load(Ordering::SeqCst), 6);

    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
    let all = h.ledger.read_since(0).await.unwrap();
    assert_eq!(all.len(), 18);
    crate::ledger::verify_contiguous(&all).unwrap();
}
