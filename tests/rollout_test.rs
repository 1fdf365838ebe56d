mod common;

use common::{definition, handle, logger};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use stepwise::client::ClientCall;
use stepwise::{
    Create, Delete, InMemoryCluster, Instruction, Orchestrator, OrchestratorConfig,
    PropagationPolicy, ResourceDefinition, RunState, ScaleReplicas, WatchError,
};

fn orchestrator(cluster: &InMemoryCluster, definition: ResourceDefinition) -> Orchestrator {
    Orchestrator::new(
        definition,
        Arc::new(cluster.clone()),
        Arc::new(cluster.clone()),
        OrchestratorConfig::default()
            .with_deadline(Duration::from_secs(10))
            .with_debug(true),
        logger(),
    )
    .expect("Orchestrator should accept a named resource")
}

#[tokio::test]
async fn test_full_rollout_against_in_memory_cluster() {
    let cluster = InMemoryCluster::new(logger());
    let _reconciler = cluster.spawn_reconciler(Duration::from_millis(20));
    let mut orchestrator = orchestrator(&cluster, definition());

    let instructions: Vec<Box<dyn Instruction>> = vec![
        Box::new(Create),
        Box::new(ScaleReplicas::new(3)),
        Box::new(Delete),
    ];
    orchestrator
        .run(&instructions)
        .await
        .expect("Rollout should succeed");

    assert_eq!(orchestrator.state(), RunState::Succeeded);
    assert!(cluster.snapshot(&handle()).await.is_none());

    // Writes went out in instruction order, with no cleanup delete
    let writes: Vec<ClientCall> = cluster
        .calls()
        .await
        .into_iter()
        .filter(|call| !matches!(call, ClientCall::Get { .. }))
        .collect();
    assert_eq!(writes.len(), 3);
    assert!(matches!(writes[0], ClientCall::Create { .. }));
    assert!(matches!(writes[1], ClientCall::Update { .. }));
    assert_eq!(
        writes[2],
        ClientCall::Delete {
            name: "iris".to_string(),
            propagation: PropagationPolicy::Background,
        }
    );
}

#[tokio::test]
async fn test_rollout_from_manifest_file() {
    let manifest = r#"
apiVersion: machinelearning.seldon.io/v1
kind: SeldonDeployment
metadata:
  name: sklearn-iris
  namespace: seldon
spec:
  replicas: 1
  predictors:
    - name: default
      graph:
        name: classifier
        implementation: SKLEARN_SERVER
"#;
    let mut file = tempfile::NamedTempFile::new().expect("Should create temp file");
    file.write_all(manifest.as_bytes())
        .expect("Should write manifest");

    let definition =
        ResourceDefinition::from_path(file.path()).expect("Manifest should parse");
    let handle = definition.handle().expect("Manifest should be named");
    assert_eq!(handle.to_string(), "seldon/sklearn-iris");

    let cluster = InMemoryCluster::new(logger());
    let _reconciler = cluster.spawn_reconciler(Duration::from_millis(10));
    let mut orchestrator = orchestrator(&cluster, definition);

    let instructions: Vec<Box<dyn Instruction>> =
        vec![Box::new(Create), Box::new(ScaleReplicas::new(2))];
    orchestrator
        .run(&instructions)
        .await
        .expect("Rollout should succeed");

    let stored = cluster
        .snapshot(&handle)
        .await
        .expect("Resource should still exist");
    assert_eq!(stored.desired_replicas, Some(2));

    let stored_definition = cluster.definition(&handle).await.unwrap();
    assert_eq!(stored_definition.replicas(), Some(2));
    assert_eq!(stored_definition.spec["predictors"][0]["name"], "default");
}

#[tokio::test]
async fn test_broken_watch_rolls_back_created_resource() {
    let cluster = InMemoryCluster::new(logger());
    // Slow enough that Create is still waiting when the watch breaks
    let _reconciler = cluster.spawn_reconciler(Duration::from_secs(5));
    let mut orchestrator = orchestrator(&cluster, definition());

    let breaker = cluster.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        breaker.close_watches(WatchError::Session("apiserver restarted".to_string()));
    });

    let instructions: Vec<Box<dyn Instruction>> = vec![Box::new(Create), Box::new(Delete)];
    let err = orchestrator.run(&instructions).await.unwrap_err();

    assert_eq!(err.index, 0);
    assert!(err.is_stream());
    assert_eq!(cluster.delete_count().await, 1);
    assert!(cluster.snapshot(&handle()).await.is_none());
}

#[tokio::test]
async fn test_unreconciled_resource_times_out() {
    let cluster = InMemoryCluster::new(logger());
    let mut orchestrator = Orchestrator::new(
        definition(),
        Arc::new(cluster.clone()),
        Arc::new(cluster.clone()),
        OrchestratorConfig::default().with_deadline(Duration::from_millis(200)),
        logger(),
    )
    .unwrap();

    // No reconciler: the resource never becomes Available
    let instructions: Vec<Box<dyn Instruction>> = vec![Box::new(Create)];
    let err = orchestrator.run(&instructions).await.unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(orchestrator.events_consumed(), 1);
    assert_eq!(cluster.delete_count().await, 1);
    assert!(cluster.snapshot(&handle()).await.is_none());

    let last = cluster.calls().await.pop();
    assert!(matches!(last, Some(ClientCall::Delete { .. })));
}
