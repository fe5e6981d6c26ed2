//! End-to-end runs through the execution service and the reconciler.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime};

use common::{ChannelSpawner, ScriptSpawner};
use lumen_core::model::{Artifact, ResultBody};
use lumen_core::protocol::{Frame, ResultPayload};
use lumen_core::reconcile::{Position, Size};
use lumen_core::{
    Anchor, ArtifactKind, BindingStore, ExecuteRequest, ExecutionService, LumenConfig, Reconciler,
};

fn service(dir: &std::path::Path) -> (ExecutionService, std::sync::Arc<ScriptSpawner>) {
    let config = LumenConfig {
        artifact_dir: Some(dir.to_path_buf()),
        ..LumenConfig::default()
    };
    let spawner = ScriptSpawner::new();
    let service = ExecutionService::with_spawner(&config, spawner.clone()).unwrap();
    (service, spawner)
}

fn request(source_id: &str, code: &str) -> ExecuteRequest {
    ExecuteRequest {
        code: code.to_string(),
        source_id: source_id.to_string(),
        session_key: "doc".to_string(),
    }
}

fn anchor() -> Anchor {
    Anchor {
        position: Position { x: 0.0, y: 0.0 },
        size: Size {
            width: 300.0,
            height: 120.0,
        },
    }
}

#[tokio::test]
async fn test_rerun_reuses_slots() {
    let dir = tempfile::tempdir().unwrap();
    let (service, spawner) = service(dir.path());
    let reconciler = Reconciler::new(LumenConfig::default().layout);
    let mut bindings = BindingStore::new();

    let code = "text:hello\nimage:/tmp/plot.png";
    let mut shown = Vec::new();
    for round in 0..3 {
        let response = service.execute(&request("cell-1", code)).await.unwrap();
        assert!(response.success);
        assert_eq!(response.source_id, "cell-1");

        let prior = bindings.prior_slots("cell-1");
        let reconciliation = reconciler.reconcile(&anchor(), &prior, &response.artifacts);
        let slots = bindings.apply("cell-1", &reconciliation);

        if round == 0 {
            assert_eq!(reconciliation.new_count(), 2);
            shown = slots;
        } else {
            assert_eq!(reconciliation.reused_count(), 2);
            assert!(reconciliation.removed.is_empty());
            assert_eq!(slots, shown);
        }
    }

    // Every run went to the same interpreter
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1);
    service.shutdown().await;
}

#[tokio::test]
async fn test_error_run_collapses_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _) = service(dir.path());
    let reconciler = Reconciler::new(LumenConfig::default().layout);
    let mut bindings = BindingStore::new();

    let first = service
        .execute(&request("cell-1", "text:a\ntext:b\nimage:/tmp/p.png"))
        .await
        .unwrap();
    let reconciliation = reconciler.reconcile(&anchor(), &[], &first.artifacts);
    bindings.apply("cell-1", &reconciliation);

    let failed = service
        .execute(&request("cell-1", "text:partial\nfail"))
        .await
        .unwrap();
    assert!(!failed.success);

    let reconciliation =
        reconciler.reconcile(&anchor(), &bindings.prior_slots("cell-1"), &failed.artifacts);
    assert_eq!(reconciliation.assignments.len(), 1);
    assert_eq!(reconciliation.assignments[0].artifact.kind, ArtifactKind::Error);
    assert!(!reconciliation.assignments[0].is_new);
    assert_eq!(reconciliation.removed.len(), 2);
    service.shutdown().await;
}

#[tokio::test]
async fn test_silent_run_shows_success_marker() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _) = service(dir.path());
    let reconciler = Reconciler::new(LumenConfig::default().layout);

    let response = service.execute(&request("cell-2", "x = 1")).await.unwrap();
    assert!(response.success);
    assert!(response.artifacts.is_empty());

    let reconciliation = reconciler.reconcile(&anchor(), &[], &response.artifacts);
    assert_eq!(reconciliation.assignments.len(), 1);
    assert_eq!(reconciliation.assignments[0].artifact.kind, ArtifactKind::Success);
    assert_eq!(reconciliation.assignments[0].slot.position, Position { x: 320.0, y: 0.0 });
    service.shutdown().await;
}

#[tokio::test]
async fn test_results_marked_consumed() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _) = service(dir.path());

    let response = service.execute(&request("cell-1", "text:x")).await.unwrap();
    let execution_id = response.execution_id.expect("delivered results carry their ID");
    assert_eq!(service.cache().is_consumed(&execution_id), Some(true));
    assert!(service.claim(&execution_id).is_none());
    assert!(service.cache().referenced_artifacts().is_empty());
    service.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_then_execute_renders_failure() {
    let dir = tempfile::tempdir().unwrap();
    let (service, spawner) = service(dir.path());

    service.execute(&request("cell-1", "text:x")).await.unwrap();
    service.shutdown().await;
    assert!(service.registry().is_empty());

    // A fresh session is started on demand
    let response = service.execute_or_render(&request("cell-1", "text:y")).await;
    assert!(response.success);
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 2);
    service.shutdown().await;
}

#[tokio::test]
async fn test_abandoned_result_keeps_artifacts_until_claimed() {
    let dir = tempfile::tempdir().unwrap();
    let config = LumenConfig {
        artifact_dir: Some(dir.path().to_path_buf()),
        ..LumenConfig::default()
    };
    let (spawner, mut interpreters) = ChannelSpawner::new();
    let service = Arc::new(ExecutionService::with_spawner(&config, spawner).unwrap());

    let caller = {
        let service = service.clone();
        tokio::spawn(async move { service.execute(&request("plot", "plot()")).await })
    };
    let mut interpreter = interpreters.recv().await.unwrap();
    interpreter.announce().await;
    let pending = interpreter.next_request().await;

    // The canvas gives up before the interpreter answers
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    let mut image = Artifact::image("aGVsbG8=");
    image.metadata.insert("encoding".into(), "base64".into());
    interpreter
        .send(&Frame::Result(ResultPayload {
            execution_id: pending.execution_id.clone(),
            result: ResultBody {
                artifacts: vec![image],
                ..ResultBody::default()
            },
        }))
        .await;

    let cached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(result) = service.cache().get(&pending.execution_id) {
                return result;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("result cached without a caller");
    assert_eq!(service.cache().is_consumed(&pending.execution_id), Some(false));
    let path = cached.artifacts[0].file_path().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"hello");

    // Unconsumed results pin their files, however old
    let later = SystemTime::now() + Duration::from_secs(60);
    let keep = service.cache().referenced_artifacts();
    assert_eq!(service.store().sweep_at(later, Duration::ZERO, &keep).unwrap(), 0);
    assert!(path.exists());

    let claimed = service.claim(&pending.execution_id).unwrap();
    assert_eq!(claimed.artifacts[0].file_path(), Some(path.clone()));
    let keep = service.cache().referenced_artifacts();
    assert_eq!(service.store().sweep_at(later, Duration::ZERO, &keep).unwrap(), 1);
    assert!(!path.exists());
    service.shutdown().await;
}
