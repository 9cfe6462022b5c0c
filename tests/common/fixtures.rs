//! Shared fixtures: a scripted agent, a stub search provider, and a fully
//! wired in-memory orchestrator harness.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use curricle::agents::{Agent, AgentError, AgentRequest, SearchError, SearchHit, SearchProvider};
use curricle::bus::NotificationBus;
use curricle::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use curricle::config::{OrchestratorConfig, RetryPolicy};
use curricle::dispatch::{
    InMemoryQueue, TaskDispatcher, WorkQueue, WorkerContext, WorkerLiveness, process_work_item,
};
use curricle::engine::WorkflowEngine;
use curricle::nodes::standard_graph;
use curricle::reconcile::StaleTaskReconciler;
use curricle::registry::{MemoryRegistry, TaskRegistry};
use curricle::review::HumanReviewGate;
use curricle::types::ContentType;

/// Deterministic agent scripted per call purpose.
pub struct ScriptedAgent {
    concepts: Vec<String>,
    fail_validation_rounds: AtomicU32,
    fail_units: Mutex<HashSet<(String, ContentType)>>,
    always_fail_purpose: Mutex<Option<String>>,
}

impl ScriptedAgent {
    pub fn new(concepts: &[&str]) -> Self {
        Self {
            concepts: concepts.iter().map(|c| c.to_string()).collect(),
            fail_validation_rounds: AtomicU32::new(0),
            fail_units: Mutex::new(HashSet::new()),
            always_fail_purpose: Mutex::new(None),
        }
    }

    /// Make the next `rounds` validation passes fail.
    pub fn fail_validation(&self, rounds: u32) {
        self.fail_validation_rounds.store(rounds, Ordering::SeqCst);
    }

    /// Make generation for one `(concept, content_type)` pair always fail.
    pub fn fail_unit(&self, concept_id: &str, content_type: ContentType) {
        self.fail_units
            .lock()
            .unwrap()
            .insert((concept_id.to_string(), content_type));
    }

    /// Undo [`fail_unit`](Self::fail_unit) so a retry can succeed.
    pub fn heal_unit(&self, concept_id: &str, content_type: ContentType) {
        self.fail_units
            .lock()
            .unwrap()
            .remove(&(concept_id.to_string(), content_type));
    }

    /// Make every call with this purpose return a format error.
    pub fn always_fail(&self, purpose: &str) {
        *self.always_fail_purpose.lock().unwrap() = Some(purpose.to_string());
    }

    fn framework_json(&self) -> Value {
        json!({
            "goal": "scripted goal",
            "concepts": self.concepts.iter().map(|c| json!({
                "concept_id": c,
                "title": format!("Concept {c}"),
                "summary": "",
            })).collect::<Vec<_>>(),
            "version": 1,
        })
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<Value, AgentError> {
        if let Some(fail) = self.always_fail_purpose.lock().unwrap().as_deref() {
            if request.purpose == fail {
                return Err(AgentError::format("scripted format failure"));
            }
        }
        match request.purpose.as_str() {
            "analyze_goal" => Ok(json!({ "scope": "scripted", "audience": "beginner" })),
            "design_framework" => Ok(self.framework_json()),
            "validate_framework" => {
                let remaining = self.fail_validation_rounds.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.fail_validation_rounds.store(remaining - 1, Ordering::SeqCst);
                    Ok(json!({ "passed": false, "issues": ["framework too shallow"] }))
                } else {
                    Ok(json!({ "passed": true, "issues": [] }))
                }
            }
            "plan_validation_edits" | "plan_review_edits" => Ok(json!({
                "intents": [{
                    "op": "revise",
                    "concept_id": self.concepts[0],
                    "title": "Refined title",
                }],
                "confidence": 0.9,
                "needs_clarification": false,
            })),
            purpose if purpose.starts_with("generate_") => {
                let concept_id = request
                    .payload
                    .get("concept_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let content_type = ContentType::decode(purpose.trim_start_matches("generate_"))
                    .expect("scripted purpose carries a content type");
                if self
                    .fail_units
                    .lock()
                    .unwrap()
                    .contains(&(concept_id.clone(), content_type))
                {
                    return Err(AgentError::format("scripted generation failure"));
                }
                Ok(json!({ "content": format!("{purpose} for {concept_id}") }))
            }
            other => Err(AgentError::format(format!("unscripted purpose: {other}"))),
        }
    }
}

/// Always-available search stub.
pub struct StubSearch;

#[async_trait]
impl SearchProvider for StubSearch {
    async fn query(&self, q: &str) -> Result<Vec<SearchHit>, SearchError> {
        Ok(vec![SearchHit {
            title: q.to_string(),
            url: "https://example.com/resource".to_string(),
            snippet: String::new(),
        }])
    }
}

/// Tight policies so failure paths resolve in milliseconds.
pub fn test_config() -> OrchestratorConfig {
    let tight = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2));
    OrchestratorConfig::default()
        .with_node_retry(tight)
        .with_worker_retry(tight)
}

/// A fully wired in-memory orchestrator.
pub struct Harness {
    pub agent: Arc<ScriptedAgent>,
    pub registry: Arc<dyn TaskRegistry>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub bus: Arc<NotificationBus>,
    pub queue: Arc<InMemoryQueue>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub liveness: Arc<WorkerLiveness>,
    pub engine: Arc<WorkflowEngine>,
    pub gate: HumanReviewGate,
    pub worker_ctx: Arc<WorkerContext>,
    pub reconciler: StaleTaskReconciler,
}

pub fn harness(agent: ScriptedAgent) -> Harness {
    harness_with(agent, test_config())
}

pub fn harness_with(agent: ScriptedAgent, config: OrchestratorConfig) -> Harness {
    let agent = Arc::new(agent);
    let registry: Arc<dyn TaskRegistry> = Arc::new(MemoryRegistry::new());
    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let bus = Arc::new(NotificationBus::new(config.event_buffer_capacity));
    let queue = Arc::new(InMemoryQueue::new());
    let liveness = Arc::new(WorkerLiveness::new());
    let dispatcher = Arc::new(TaskDispatcher::new(
        registry.clone(),
        queue.clone() as Arc<dyn WorkQueue>,
        bus.clone(),
    ));
    let graph = Arc::new(
        standard_graph(agent.clone() as Arc<dyn Agent>).expect("standard graph compiles"),
    );
    let engine = Arc::new(WorkflowEngine::new(
        graph,
        registry.clone(),
        checkpoints.clone(),
        bus.clone(),
        dispatcher.clone(),
        liveness.clone(),
        config.clone(),
    ));
    let gate = HumanReviewGate::new(engine.clone());
    let worker_ctx = Arc::new(WorkerContext::new(
        registry.clone(),
        bus.clone(),
        agent.clone() as Arc<dyn Agent>,
        Arc::new(StubSearch),
        liveness.clone(),
        config.clone(),
    ));
    let reconciler = StaleTaskReconciler::new(
        registry.clone(),
        checkpoints.clone(),
        liveness.clone(),
        bus.clone(),
        config.stale_grace,
    );
    Harness {
        agent,
        registry,
        checkpoints,
        bus,
        queue,
        dispatcher,
        liveness,
        engine,
        gate,
        worker_ctx,
        reconciler,
    }
}

impl Harness {
    /// Process queued units inline until the queue stays empty.
    pub async fn drain_queue(&self) {
        loop {
            let next = tokio::time::timeout(Duration::from_millis(50), self.queue.recv()).await;
            match next {
                Ok(Some(item)) => process_work_item(&self.worker_ctx, item, 0).await,
                Ok(None) | Err(_) => break,
            }
        }
    }
}
