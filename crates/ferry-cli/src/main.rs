//! ferry-cli: run one finalize-migration end to end against an in-memory
//! cluster, printing progress through tracing.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing_subscriber::EnvFilter;

use ferry_core::config::EngineConfig;
use ferry_core::domain::TaskStage;
use ferry_core::engine::DocumentDriver;
use ferry_core::error::FerryError;
use ferry_core::impls::{ChildScript, InMemoryDocumentStore};
use ferry_core::ports::DocumentStore;
use ferry_core::workflow::documents::{
    BULK_PROVISION_FACTORY_LINK, COPY_STATE_TASK_FACTORY_LINK, COPY_STATE_TASK_KIND,
    COPY_STATE_TRIGGER_KIND, DEPLOYMENT_FACTORY_LINK, DEPLOYMENT_KIND, HOST_KIND,
    UPGRADE_AGENT_TASK_FACTORY_LINK, USAGE_TAG_CLOUD,
};
use ferry_core::workflow::{
    EntityKindMapping, MigrationContext, MigrationState, MigrationWorkflow,
};

const NODE_GROUP_LINK: &str = "/source/node-groups/default";
const DEPLOYMENT_ID: &str = "dep-1";

#[tokio::main]
async fn main() -> Result<(), FerryError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let store = Arc::new(InMemoryDocumentStore::new(3));
    seed_cluster(&store);

    let context = MigrationContext {
        upgrade_information: vec![
            EntityKindMapping::new("/photon/flavors", "/dest/flavors"),
            EntityKindMapping::new("/photon/hosts", "/dest/hosts").with_host_transformation(),
        ],
        destination_uri: "http://destination:19000".to_string(),
    };

    let start = MigrationState::create(NODE_GROUP_LINK, DEPLOYMENT_ID).with_poll_delay_ms(50);

    let store_dyn: Arc<dyn DocumentStore> = store.clone();
    let mut handle = DocumentDriver::start(
        Arc::new(MigrationWorkflow::new(context)),
        store_dyn,
        EngineConfig::default_v1(),
        start,
    )
    .await?;

    let terminal = handle.wait_terminal().await;
    handle.shutdown_and_join().await;

    match terminal.task_state.stage {
        TaskStage::Finished => {
            tracing::info!("migration finished");
            Ok(())
        }
        stage => {
            let detail = terminal
                .task_state
                .failure
                .map(|f| f.message)
                .unwrap_or_default();
            tracing::error!(stage = %stage, detail, "migration did not finish");
            Err(FerryError::Other(format!(
                "migration ended in stage {stage}"
            )))
        }
    }
}

/// Seed a small source/destination topology: two source nodes, one running
/// copy trigger, a prior incremental copy, and two upgradeable hosts.
fn seed_cluster(store: &InMemoryDocumentStore) {
    store.seed(
        NODE_GROUP_LINK,
        "node-group",
        json!({
            "nodes": {
                "node-0": { "group_reference": "http://10.0.0.1:19000/core/node-groups/default" },
                "node-1": { "group_reference": "http://10.0.0.2:19000/core/node-groups/default" },
            }
        }),
    );
    store.seed(
        format!("{DEPLOYMENT_FACTORY_LINK}/{DEPLOYMENT_ID}"),
        DEPLOYMENT_KIND,
        json!({ "oauth_enabled": true }),
    );
    store.seed(
        "/ferry/copy-state-triggers/flavors",
        COPY_STATE_TRIGGER_KIND,
        json!({ "execution_state": "RUNNING" }),
    );
    store.seed(
        "/ferry/copy-state-tasks/prior",
        COPY_STATE_TASK_KIND,
        json!({
            "task_state": { "stage": "FINISHED" },
            "source_base_uris": ["http://10.0.0.1:19000", "http://10.0.0.2:19000"],
            "source_factory_link": "/photon/flavors",
            "destination_uri": "http://destination:19000",
            "destination_factory_link": "/dest/flavors",
            "last_document_update_time_epoch_ms": 1_723_000_000_000u64,
        }),
    );
    store.seed(
        "/hosts/esx-1",
        HOST_KIND,
        json!({ "state": "READY", "usage_tags": [USAGE_TAG_CLOUD] }),
    );
    store.seed(
        "/hosts/esx-2",
        HOST_KIND,
        json!({ "state": "READY", "usage_tags": [USAGE_TAG_CLOUD] }),
    );

    store.register_factory(
        COPY_STATE_TASK_FACTORY_LINK,
        COPY_STATE_TASK_KIND,
        ChildScript::finishes_after(Duration::from_millis(100)),
    );
    store.register_factory(
        BULK_PROVISION_FACTORY_LINK,
        "ferry/bulk-provision",
        ChildScript::finishes_after(Duration::from_millis(200)),
    );
    store.register_factory(
        UPGRADE_AGENT_TASK_FACTORY_LINK,
        "ferry/upgrade-agent-task",
        ChildScript::finishes_after(Duration::from_millis(150)),
    );
}
