//! The finalize-migration workflow: four sub-stages that drain in-flight
//! replication, take a final incremental copy, and rebuild the destination
//! cluster's host agents.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use ulid::Ulid;

use super::documents::{
    BULK_PROVISION_FACTORY_LINK, BulkProvisionStartState, COPY_STATE_TASK_FACTORY_LINK,
    COPY_STATE_TASK_KIND, COPY_STATE_TRIGGER_KIND, CopyStateTaskState, DEPLOYMENT_FACTORY_LINK,
    DeploymentState, ExecutionState, HOST_KIND, HostLifecycleState, MIGRATION_FACTORY_LINK,
    MIGRATION_KIND, MIGRATION_STATUS_TRIGGER_FACTORY_LINK, NodeGroupState,
    UPGRADE_AGENT_TASK_FACTORY_LINK, USAGE_TAG_CLOUD, UpgradeAgentStartState, extract_base_uri,
    extract_child_task_state, extract_self_link,
};
use crate::config::EngineConfig;
use crate::domain::{TaskDocument, TaskStage, TaskState, control_flags};
use crate::engine::{
    PollingWait, Workflow, WorkflowContext, join_all_collecting, start_task_and_await,
};
use crate::error::FerryError;
use crate::query::{QuerySpec, merge_replica_results};

/// Sub-stages of the finalize migration, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationSubStage {
    StopMigrateTasks,
    MigrateFinal,
    ReinstallAgents,
    UpgradeAgents,
}

impl crate::domain::SubStage for MigrationSubStage {
    const ORDER: &'static [Self] = &[
        MigrationSubStage::StopMigrateTasks,
        MigrationSubStage::MigrateFinal,
        MigrationSubStage::ReinstallAgents,
        MigrationSubStage::UpgradeAgents,
    ];
}

/// The persisted migration workflow document.
///
/// Every field except the task state is optional so that the same type doubles
/// as a patch body: an omitted field leaves the current value untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationState {
    pub task_state: TaskState<MigrationSubStage>,

    /// Immutable after creation. A set DISABLE_OPERATION_PROCESSING bit stops
    /// the document from driving itself (test harness hook).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_flags: Option<u32>,

    /// Poll interval for waiting on children. Defaulted on creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_poll_delay_ms: Option<u64>,

    /// Immutable. Link to the source cluster's node group membership document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_group_reference: Option<String>,

    /// Write-once. Resolved lazily from `source_group_reference` on the first
    /// pass through STARTED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node_base_uris: Option<Vec<String>>,

    /// Immutable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_deployment_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_expiration_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_self_link: Option<String>,
}

impl MigrationState {
    /// Start state as an external caller builds it.
    pub fn create(
        source_group_reference: impl Into<String>,
        destination_deployment_id: impl Into<String>,
    ) -> Self {
        Self {
            task_state: TaskState::created(),
            control_flags: None,
            task_poll_delay_ms: None,
            source_group_reference: Some(source_group_reference.into()),
            source_node_base_uris: None,
            destination_deployment_id: Some(destination_deployment_id.into()),
            document_expiration_time: None,
            document_self_link: None,
        }
    }

    pub fn with_poll_delay_ms(mut self, ms: u64) -> Self {
        self.task_poll_delay_ms = Some(ms);
        self
    }

    pub fn with_control_flags(mut self, flags: u32) -> Self {
        self.control_flags = Some(flags);
        self
    }

    /// Patch advancing to the given sub-stage.
    pub fn progress_patch(sub_stage: MigrationSubStage) -> Self {
        Self::patch_of(TaskState::started(sub_stage))
    }

    fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.task_poll_delay_ms.unwrap_or(500))
    }
}

impl TaskDocument for MigrationState {
    type Sub = MigrationSubStage;

    fn task_state(&self) -> &TaskState<MigrationSubStage> {
        &self.task_state
    }

    fn task_state_mut(&mut self) -> &mut TaskState<MigrationSubStage> {
        &mut self.task_state
    }

    fn self_link(&self) -> Option<&str> {
        self.document_self_link.as_deref()
    }

    fn patch_of(task_state: TaskState<MigrationSubStage>) -> Self {
        Self {
            task_state,
            control_flags: None,
            task_poll_delay_ms: None,
            source_group_reference: None,
            source_node_base_uris: None,
            destination_deployment_id: None,
            document_expiration_time: None,
            document_self_link: None,
        }
    }

    fn processing_disabled(&self) -> bool {
        self.control_flags
            .is_some_and(control_flags::is_operation_processing_disabled)
    }
}

/// One replicated entity kind: documents are copied from the source factory
/// to the destination factory.
#[derive(Debug, Clone)]
pub struct EntityKindMapping {
    pub source_factory_link: String,
    pub destination_factory_link: String,
    pub transform_host_documents: bool,
}

impl EntityKindMapping {
    pub fn new(
        source_factory_link: impl Into<String>,
        destination_factory_link: impl Into<String>,
    ) -> Self {
        Self {
            source_factory_link: source_factory_link.into(),
            destination_factory_link: destination_factory_link.into(),
            transform_host_documents: false,
        }
    }

    /// Host documents need their addresses rewritten while copying.
    pub fn with_host_transformation(mut self) -> Self {
        self.transform_host_documents = true;
        self
    }
}

/// Deployment-wide wiring the workflow needs beyond its own document: which
/// entity kinds replicate, and where the destination cluster lives.
#[derive(Debug, Clone)]
pub struct MigrationContext {
    pub upgrade_information: Vec<EntityKindMapping>,
    pub destination_uri: String,
}

/// The finalize-migration workflow.
pub struct MigrationWorkflow {
    context: MigrationContext,
}

impl MigrationWorkflow {
    pub fn new(context: MigrationContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Workflow for MigrationWorkflow {
    type State = MigrationState;

    const KIND: &'static str = MIGRATION_KIND;

    fn normalize(
        &self,
        state: &mut MigrationState,
        config: &EngineConfig,
    ) -> Result<(), FerryError> {
        if state.task_poll_delay_ms.is_none() {
            state.task_poll_delay_ms = Some(config.default_poll_delay.as_millis() as u64);
        }
        if state.document_expiration_time.is_none() {
            state.document_expiration_time = Some(Utc::now() + config.default_expiration);
        }
        if state.document_self_link.is_none() {
            let id = Ulid::new().to_string().to_lowercase();
            state.document_self_link = Some(format!("{MIGRATION_FACTORY_LINK}/{id}"));
        }
        Ok(())
    }

    fn validate(&self, state: &MigrationState) -> Result<(), FerryError> {
        state.task_state.validate()?;
        require(&state.source_group_reference, "source_group_reference")?;
        require(
            &state.destination_deployment_id,
            "destination_deployment_id",
        )?;
        let delay = require(&state.task_poll_delay_ms, "task_poll_delay_ms")?;
        if *delay == 0 {
            return Err(FerryError::Validation(
                "task_poll_delay_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_patch(
        &self,
        current: &MigrationState,
        patch: &MigrationState,
    ) -> Result<(), FerryError> {
        reject_set(&patch.control_flags, "control_flags")?;
        reject_set(&patch.source_group_reference, "source_group_reference")?;
        reject_set(
            &patch.destination_deployment_id,
            "destination_deployment_id",
        )?;
        reject_set(&patch.document_self_link, "document_self_link")?;
        reject_set(
            &patch.document_expiration_time,
            "document_expiration_time",
        )?;
        if current.source_node_base_uris.is_some() && patch.source_node_base_uris.is_some() {
            return Err(FerryError::Validation(
                "source_node_base_uris is write-once".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_patch(&self, current: &mut MigrationState, patch: &MigrationState) {
        if let Some(delay) = patch.task_poll_delay_ms {
            current.task_poll_delay_ms = Some(delay);
        }
        if let Some(uris) = &patch.source_node_base_uris {
            current.source_node_base_uris = Some(uris.clone());
        }
    }

    async fn process_started(
        &self,
        ctx: &WorkflowContext<MigrationState>,
        state: MigrationState,
    ) -> Result<(), FerryError> {
        if state.source_node_base_uris.is_none() {
            return populate_source_uris(ctx, &state).await;
        }
        let sub_stage = state.task_state.sub_stage.ok_or_else(|| {
            FerryError::Validation("started document has no sub-stage".to_string())
        })?;
        tracing::info!(sub_stage = ?sub_stage, "processing sub-stage");
        match sub_stage {
            MigrationSubStage::StopMigrateTasks => self.stop_migrate_tasks(ctx, &state).await,
            MigrationSubStage::MigrateFinal => self.migrate_final(ctx, &state).await,
            MigrationSubStage::ReinstallAgents => self.reinstall_agents(ctx, &state).await,
            MigrationSubStage::UpgradeAgents => self.upgrade_agents(ctx, &state).await,
        }
    }
}

impl MigrationWorkflow {
    /// STOP_MIGRATE_TASKS: stop every recurring copy trigger (best-effort),
    /// then wait for in-flight copy tasks to drain.
    async fn stop_migrate_tasks(
        &self,
        ctx: &WorkflowContext<MigrationState>,
        state: &MigrationState,
    ) -> Result<(), FerryError> {
        let triggers = QuerySpec::for_kind(COPY_STATE_TRIGGER_KIND);
        let replicas = ctx.store.broadcast_query(&triggers).await?;
        let merged = merge_replica_results(replicas);

        if !merged.is_empty() {
            let stops = merged
                .into_iter()
                .map(|result| {
                    let store = Arc::clone(&ctx.store);
                    async move {
                        store
                            .patch(
                                &result.self_link,
                                json!({ "execution_state": ExecutionState::Stopped }),
                            )
                            .await?;
                        Ok::<(), FerryError>(())
                    }
                })
                .collect::<Vec<_>>();
            // Stopping triggers is best-effort: a trigger that cannot be
            // reached will have its tasks drained by the settle wait below.
            if let Err(err) = join_all_collecting(stops).await {
                tracing::warn!(error = %err, "some copy triggers could not be stopped");
            }
        }

        PollingWait::new(state.poll_delay())
            .wait_for_tasks_settled(&ctx.store, &running_copy_tasks_query())
            .await?;

        ctx.self_patch(MigrationState::progress_patch(MigrationSubStage::MigrateFinal))
            .await;
        Ok(())
    }

    /// MIGRATE_FINAL: one last incremental copy per entity kind, scoped to
    /// documents changed since the last copy's high-water mark.
    async fn migrate_final(
        &self,
        ctx: &WorkflowContext<MigrationState>,
        state: &MigrationState,
    ) -> Result<(), FerryError> {
        let marks = read_high_water_marks(ctx).await?;
        let source_base_uris = require(&state.source_node_base_uris, "source_node_base_uris")?;
        let poll_delay = state.poll_delay();

        let launches = self
            .context
            .upgrade_information
            .iter()
            .map(|mapping| {
                let store = Arc::clone(&ctx.store);
                let start = CopyStateTaskState {
                    task_state: Default::default(),
                    source_base_uris: source_base_uris.clone(),
                    source_factory_link: mapping.source_factory_link.clone(),
                    destination_uri: self.context.destination_uri.clone(),
                    destination_factory_link: mapping.destination_factory_link.clone(),
                    query_documents_changed_since_epoch_ms: marks
                        .get(&mapping.source_factory_link)
                        .copied()
                        .unwrap_or(0),
                    perform_host_transformation: mapping.transform_host_documents,
                    last_document_update_time_epoch_ms: None,
                };
                let source_factory = mapping.source_factory_link.clone();
                async move {
                    let body = start_task_and_await(
                        &store,
                        COPY_STATE_TASK_FACTORY_LINK,
                        to_body(&start)?,
                        TaskStage::is_terminal,
                        poll_delay,
                    )
                    .await
                    .map_err(|e| {
                        FerryError::ChildFailed(format!("copy of {source_factory}: {e}"))
                    })?;
                    child_outcome(&body)
                        .map_err(|e| FerryError::ChildFailed(format!("copy of {source_factory}: {e}")))
                }
            })
            .collect::<Vec<_>>();

        join_all_collecting(launches).await?;

        PollingWait::new(poll_delay)
            .wait_for_tasks_settled(&ctx.store, &running_copy_tasks_query())
            .await?;

        let deployment_id = require(&state.destination_deployment_id, "destination_deployment_id")?;
        ctx.store
            .delete(&format!(
                "{MIGRATION_STATUS_TRIGGER_FACTORY_LINK}/{deployment_id}"
            ))
            .await?;

        ctx.self_patch(MigrationState::progress_patch(
            MigrationSubStage::ReinstallAgents,
        ))
        .await;
        Ok(())
    }

    /// REINSTALL_AGENTS: one bulk provisioning child covering every ready
    /// cloud host of the destination deployment.
    async fn reinstall_agents(
        &self,
        ctx: &WorkflowContext<MigrationState>,
        state: &MigrationState,
    ) -> Result<(), FerryError> {
        let deployment_id = require(&state.destination_deployment_id, "destination_deployment_id")?;
        let deployment_link = format!("{DEPLOYMENT_FACTORY_LINK}/{deployment_id}");
        let body = ctx.store.get(&deployment_link).await?;
        let deployment: DeploymentState = serde_json::from_value(body)
            .map_err(|e| FerryError::Validation(format!("unparseable deployment: {e}")))?;

        let start = BulkProvisionStartState {
            deployment_link,
            usage_tag: USAGE_TAG_CLOUD.to_string(),
            host_state: HostLifecycleState::Ready,
            create_cert: deployment.oauth_enabled,
            task_state: Default::default(),
        };
        let body = start_task_and_await(
            &ctx.store,
            BULK_PROVISION_FACTORY_LINK,
            to_body(&start)?,
            TaskStage::is_terminal,
            state.poll_delay(),
        )
        .await?;

        let child = extract_child_task_state(&body)?;
        match child.stage {
            TaskStage::Finished => {
                ctx.self_patch(MigrationState::progress_patch(
                    MigrationSubStage::UpgradeAgents,
                ))
                .await;
                Ok(())
            }
            TaskStage::Cancelled => {
                // The provisioning child was cancelled out from under us;
                // cancel the migration rather than failing it.
                ctx.self_patch(MigrationState::patch_of(TaskState::cancelled()))
                    .await;
                Ok(())
            }
            TaskStage::Failed => Err(FerryError::ChildFailed(format!(
                "agent reinstall: {}",
                child
                    .failure
                    .map(|f| f.message)
                    .unwrap_or_else(|| "no failure detail".to_string())
            ))),
            other => Err(FerryError::UnexpectedChildStage {
                stage: other.to_string(),
                link: extract_self_link(&body).unwrap_or_default(),
            }),
        }
    }

    /// UPGRADE_AGENTS: one upgrade child per ready cloud host, all
    /// concurrently; any child failure fails the migration with the full
    /// aggregate.
    async fn upgrade_agents(
        &self,
        ctx: &WorkflowContext<MigrationState>,
        state: &MigrationState,
    ) -> Result<(), FerryError> {
        let hosts = QuerySpec::for_kind(HOST_KIND)
            .with_field("state", "READY")
            .with_field("usage_tags", USAGE_TAG_CLOUD);
        let replicas = ctx.store.broadcast_query(&hosts).await?;
        let merged = merge_replica_results(replicas);

        if merged.is_empty() {
            tracing::info!("no hosts need an agent upgrade");
            ctx.self_patch(MigrationState::patch_of(TaskState::finished()))
                .await;
            return Ok(());
        }

        let poll_delay = state.poll_delay();
        let launches = merged
            .into_iter()
            .map(|host| {
                let store = Arc::clone(&ctx.store);
                let start = UpgradeAgentStartState {
                    host_link: host.self_link,
                    task_state: Default::default(),
                };
                async move {
                    let body = start_task_and_await(
                        &store,
                        UPGRADE_AGENT_TASK_FACTORY_LINK,
                        to_body(&start)?,
                        TaskStage::is_terminal,
                        poll_delay,
                    )
                    .await?;
                    child_outcome(&body)
                }
            })
            .collect::<Vec<_>>();

        join_all_collecting(launches).await?;

        ctx.self_patch(MigrationState::patch_of(TaskState::finished()))
            .await;
        Ok(())
    }
}

/// Resolve the source cluster's node base URIs from its node group membership
/// document, then re-assert the current stage so the next pass dispatches the
/// sub-stage with the URIs in place.
async fn populate_source_uris(
    ctx: &WorkflowContext<MigrationState>,
    state: &MigrationState,
) -> Result<(), FerryError> {
    let group_link = require(&state.source_group_reference, "source_group_reference")?;
    let body = ctx.store.get(group_link).await?;
    let group: NodeGroupState = serde_json::from_value(body)
        .map_err(|e| FerryError::Validation(format!("unparseable node group: {e}")))?;

    let mut uris = group
        .nodes
        .values()
        .map(|node| extract_base_uri(&node.group_reference))
        .collect::<Result<Vec<_>, _>>()?;
    uris.sort_unstable();
    uris.dedup();
    if uris.is_empty() {
        return Err(FerryError::Validation(format!(
            "node group {group_link} has no members"
        )));
    }
    tracing::info!(count = uris.len(), "resolved source node base URIs");

    let mut patch = MigrationState::patch_of(state.task_state.clone());
    patch.source_node_base_uris = Some(uris);
    ctx.self_patch(patch).await;
    Ok(())
}

/// Copy-state tasks still in flight; cancelled and failed tasks do not hold
/// the migration up.
fn running_copy_tasks_query() -> QuerySpec {
    QuerySpec::for_kind(COPY_STATE_TASK_KIND)
        .without_field("task_state.stage", "CANCELLED")
        .without_field("task_state.stage", "FAILED")
        .expand()
}

/// Per source entity kind, the latest document update time any previous copy
/// observed. The final copy starts from these marks.
async fn read_high_water_marks(
    ctx: &WorkflowContext<MigrationState>,
) -> Result<HashMap<String, u64>, FerryError> {
    let query = QuerySpec::for_kind(COPY_STATE_TASK_KIND).expand();
    let replicas = ctx.store.broadcast_query(&query).await?;
    let merged = merge_replica_results(replicas);

    let mut marks: HashMap<String, u64> = HashMap::new();
    for result in merged {
        let Some(body) = result.body else { continue };
        let Ok(task) = serde_json::from_value::<CopyStateTaskState>(body) else {
            continue;
        };
        if let Some(mark) = task.last_document_update_time_epoch_ms {
            let entry = marks.entry(task.source_factory_link).or_insert(0);
            *entry = (*entry).max(mark);
        }
    }
    Ok(marks)
}

/// Translate a settled child's terminal state into the parent's outcome.
fn child_outcome(body: &Value) -> Result<(), FerryError> {
    let link = extract_self_link(body).unwrap_or_default();
    let child = extract_child_task_state(body)?;
    match child.stage {
        TaskStage::Finished => Ok(()),
        TaskStage::Cancelled => Err(FerryError::ChildCancelled(link)),
        TaskStage::Failed => Err(FerryError::ChildFailed(format!(
            "{link}: {}",
            child
                .failure
                .map(|f| f.message)
                .unwrap_or_else(|| "no failure detail".to_string())
        ))),
        other => Err(FerryError::UnexpectedChildStage {
            stage: other.to_string(),
            link,
        }),
    }
}

fn require<'a, T>(field: &'a Option<T>, name: &str) -> Result<&'a T, FerryError> {
    field
        .as_ref()
        .ok_or_else(|| FerryError::Validation(format!("{name} is required")))
}

fn reject_set<T>(field: &Option<T>, name: &str) -> Result<(), FerryError> {
    if field.is_some() {
        return Err(FerryError::Validation(format!("{name} is immutable")));
    }
    Ok(())
}

fn to_body<T: Serialize>(value: &T) -> Result<Value, FerryError> {
    serde_json::to_value(value)
        .map_err(|e| FerryError::Validation(format!("unserializable start state: {e}")))
}
