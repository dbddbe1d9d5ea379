//! In-memory document store with scripted child task factories.
//!
//! Stands in for the replicated store in tests and the demo binary. Child
//! factories can be scripted: a document created at a scripted factory starts
//! in CREATED and settles into a configured terminal stage after a delay, the
//! way a real child task service would run and finish on its own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::domain::TaskStage;
use crate::error::FerryError;
use crate::ports::DocumentStore;
use crate::query::{QueryResult, QuerySpec};

type ScriptFn = Arc<dyn Fn(&Value) -> ChildScript + Send + Sync>;
type CreateGate = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// How a scripted child task runs: the terminal stage it settles into, an
/// optional failure message, and how long it takes to get there.
#[derive(Clone)]
pub struct ChildScript {
    terminal_stage: TaskStage,
    failure_message: Option<String>,
    settle_delay: Duration,
}

impl ChildScript {
    pub fn finishes() -> Self {
        Self::settles(TaskStage::Finished)
    }

    pub fn finishes_after(settle_delay: Duration) -> Self {
        Self {
            settle_delay,
            ..Self::settles(TaskStage::Finished)
        }
    }

    pub fn fails(message: impl Into<String>) -> Self {
        Self {
            failure_message: Some(message.into()),
            ..Self::settles(TaskStage::Failed)
        }
    }

    pub fn cancelled() -> Self {
        Self::settles(TaskStage::Cancelled)
    }

    fn settles(terminal_stage: TaskStage) -> Self {
        Self {
            terminal_stage,
            failure_message: None,
            settle_delay: Duration::from_millis(10),
        }
    }
}

struct FactoryRegistration {
    kind: String,
    script: Option<ScriptFn>,
    create_gate: Option<CreateGate>,
    next_doc: u64,
}

struct StoredDoc {
    kind: String,
    body: Value,
}

#[derive(Default)]
struct StoreInner {
    docs: HashMap<String, StoredDoc>,
    factories: HashMap<String, FactoryRegistration>,
    broadcast_failure: Option<String>,
}

/// An in-memory [`DocumentStore`]. `replica_count` controls how many copies
/// of the result set a broadcast query reports, exercising the caller-side
/// merge.
pub struct InMemoryDocumentStore {
    inner: Arc<Mutex<StoreInner>>,
    replica_count: usize,
}

impl InMemoryDocumentStore {
    pub fn new(replica_count: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner::default())),
            replica_count: replica_count.max(1),
        }
    }

    /// Register a factory whose children all follow the same script.
    pub fn register_factory(&self, factory_link: &str, kind: &str, script: ChildScript) {
        self.register_factory_with(factory_link, kind, move |_| script.clone());
    }

    /// Register a factory whose script depends on the start body.
    pub fn register_factory_with(
        &self,
        factory_link: &str,
        kind: &str,
        script: impl Fn(&Value) -> ChildScript + Send + Sync + 'static,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.factories.insert(
            factory_link.to_string(),
            FactoryRegistration {
                kind: kind.to_string(),
                script: Some(Arc::new(script)),
                create_gate: None,
                next_doc: 0,
            },
        );
    }

    /// Make creations at a registered factory fail selectively, simulating an
    /// unreachable or rejecting factory.
    pub fn set_create_gate(
        &self,
        factory_link: &str,
        gate: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) {
        let mut inner = self.inner.lock().unwrap();
        match inner.factories.get_mut(factory_link) {
            Some(factory) => factory.create_gate = Some(Arc::new(gate)),
            None => tracing::warn!(factory_link, "create gate on unregistered factory ignored"),
        }
    }

    /// Insert a document directly, bypassing factories.
    pub fn seed(&self, self_link: impl Into<String>, kind: &str, mut body: Value) {
        let self_link = self_link.into();
        if body.get("document_self_link").is_none() {
            body["document_self_link"] = json!(self_link);
        }
        let mut inner = self.inner.lock().unwrap();
        inner.docs.insert(
            self_link,
            StoredDoc {
                kind: kind.to_string(),
                body,
            },
        );
    }

    /// Make every broadcast query fail, simulating an unreachable replica.
    pub fn set_broadcast_failure(&self, message: impl Into<String>) {
        self.inner.lock().unwrap().broadcast_failure = Some(message.into());
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn create(&self, factory_link: &str, mut body: Value) -> Result<String, FerryError> {
        let (self_link, script) = {
            let mut inner = self.inner.lock().unwrap();
            let factory = inner
                .factories
                .get_mut(factory_link)
                .ok_or_else(|| FerryError::NotFound(format!("factory {factory_link}")))?;
            if let Some(gate) = &factory.create_gate {
                gate(&body).map_err(FerryError::Transport)?;
            }
            factory.next_doc += 1;
            let self_link = format!("{factory_link}/{}", factory.next_doc);
            let kind = factory.kind.clone();
            let script = factory.script.as_ref().map(|f| f(&body));

            body["document_self_link"] = json!(self_link);
            if script.is_some() && body.get("task_state").is_none() {
                body["task_state"] = json!({ "stage": "CREATED" });
            }
            inner.docs.insert(
                self_link.clone(),
                StoredDoc { kind, body },
            );
            (self_link, script)
        };

        if let Some(script) = script {
            let inner = Arc::clone(&self.inner);
            let link = self_link.clone();
            tokio::spawn(async move {
                tokio::time::sleep(script.settle_delay).await;
                let mut inner = inner.lock().unwrap();
                if let Some(doc) = inner.docs.get_mut(&link) {
                    let mut task_state = json!({ "stage": script.terminal_stage.to_string() });
                    if let Some(message) = script.failure_message {
                        task_state["failure"] = json!({ "message": message });
                    }
                    doc.body["task_state"] = task_state;
                }
            });
        }
        Ok(self_link)
    }

    async fn get(&self, self_link: &str) -> Result<Value, FerryError> {
        let inner = self.inner.lock().unwrap();
        inner
            .docs
            .get(self_link)
            .map(|doc| doc.body.clone())
            .ok_or_else(|| FerryError::NotFound(self_link.to_string()))
    }

    async fn patch(&self, self_link: &str, patch: Value) -> Result<Value, FerryError> {
        let mut inner = self.inner.lock().unwrap();
        let doc = inner
            .docs
            .get_mut(self_link)
            .ok_or_else(|| FerryError::NotFound(self_link.to_string()))?;
        if let (Some(body), Value::Object(fields)) = (doc.body.as_object_mut(), patch) {
            for (key, value) in fields {
                body.insert(key, value);
            }
        }
        Ok(doc.body.clone())
    }

    async fn delete(&self, self_link: &str) -> Result<(), FerryError> {
        // Idempotent: deleting an absent document is a no-op.
        self.inner.lock().unwrap().docs.remove(self_link);
        Ok(())
    }

    async fn put(&self, self_link: &str, kind: &str, body: Value) -> Result<(), FerryError> {
        let mut inner = self.inner.lock().unwrap();
        inner.docs.insert(
            self_link.to_string(),
            StoredDoc {
                kind: kind.to_string(),
                body,
            },
        );
        Ok(())
    }

    async fn broadcast_query(
        &self,
        query: &QuerySpec,
    ) -> Result<Vec<Vec<QueryResult>>, FerryError> {
        let inner = self.inner.lock().unwrap();
        if let Some(message) = &inner.broadcast_failure {
            return Err(FerryError::Transport(message.clone()));
        }
        let matches: Vec<QueryResult> = inner
            .docs
            .iter()
            .filter(|(_, doc)| query.matches(&doc.kind, &doc.body))
            .map(|(link, doc)| {
                if query.expand_content {
                    QueryResult::expanded(link.clone(), doc.body.clone())
                } else {
                    QueryResult::link_only(link.clone())
                }
            })
            .collect();
        // Every replica reports the full match set; callers must merge.
        Ok(vec![matches; self.replica_count])
    }
}
