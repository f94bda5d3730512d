mod support;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use coherence::application::engine::SessionPlan;
use coherence::application::error::SessionError;
use coherence::application::repos::RemoteError;
use coherence::domain::keys::{CacheKey, ResourceKind};
use coherence::domain::references::ReferenceTable;
use coherence::infra::memory::MemoryStore;
use coherence_wire::ReadResponse;
use serde_json::{Map, Value, json};

use support::{ScriptedRemote, clock, engine, test_config};

const ORDERS: [[usize; 3]; 6] = [
    [0, 1, 2],
    [0, 2, 1],
    [1, 0, 2],
    [1, 2, 0],
    [2, 0, 1],
    [2, 1, 0],
];

fn session_keys() -> [CacheKey; 3] {
    [
        CacheKey::singleton("entity_types"),
        CacheKey::singleton("status_catalog"),
        CacheKey::references("employee"),
    ]
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn gate_opens_only_after_every_prefetch_in_any_order() {
    for order in ORDERS {
        let remote = ScriptedRemote::new();
        let engine = Arc::new(engine(
            test_config(),
            Arc::new(MemoryStore::new()),
            remote.clone(),
            clock(),
        ));
        let keys = session_keys();
        remote.on_read(keys[0].clone(), Ok(ReadResponse::new(json!(["person", "site"]))));
        remote.on_read(keys[1].clone(), Ok(ReadResponse::new(json!({ "open": "Open" }))));
        remote.on_read(keys[2].clone(), Ok(ReadResponse::new(json!({ "E1": "Ada" }))));
        let mut releases: Vec<_> = keys
            .iter()
            .map(|key| Some(remote.hold_read(key.clone())))
            .collect();

        let session = tokio::spawn({
            let engine = engine.clone();
            let plan = SessionPlan::new(keys.clone());
            async move { engine.start_session(plan).await }
        });
        settle().await;

        for (step, index) in order.iter().enumerate() {
            assert!(
                !engine.is_open(),
                "order {order:?}: open before step {step}"
            );
            let release = releases[*index].take().expect("released once");
            release.send(()).expect("read waiting");
            settle().await;
        }

        session
            .await
            .expect("task")
            .unwrap_or_else(|err| panic!("order {order:?}: {err}"));
        assert!(engine.is_open(), "order {order:?}: gate stayed closed");
        for key in &keys {
            assert!(
                engine.get_sync(key).is_some(),
                "order {order:?}: {key} missing after open"
            );
        }
        assert!(engine.gate_state().missing().is_empty());
    }
}

#[tokio::test]
async fn bulk_reference_load_racing_incidental_names_is_complete_at_open() {
    let remote = ScriptedRemote::new();
    let engine = Arc::new(engine(
        test_config(),
        Arc::new(MemoryStore::new()),
        remote.clone(),
        clock(),
    ));
    let references = CacheKey::references("employee");
    let bulk: Map<String, Value> = (0..250)
        .map(|n| (format!("E{n}"), json!(format!("Employee {n}"))))
        .collect();
    remote.on_read(references.clone(), Ok(ReadResponse::new(Value::Object(bulk))));
    let release = remote.hold_read(references.clone());

    let session = tokio::spawn({
        let engine = engine.clone();
        let plan = SessionPlan::new([references.clone()]);
        async move { engine.start_session(plan).await }
    });
    settle().await;

    let tasks = CacheKey::list("task", json!({ "assignee": "E7" }));
    remote.on_read(
        tasks.clone(),
        Ok(
            ReadResponse::new(json!([{ "id": "T1", "assignee": "E7" }])).with_reference_names(
                BTreeMap::from([(
                    "employee".to_string(),
                    BTreeMap::from([("E7".to_string(), "Employee 7".to_string())]),
                )]),
            ),
        ),
    );
    engine.fetch(&tasks).await.expect("incidental list");
    assert!(!engine.is_open(), "open with only incidental names");

    release.send(()).expect("bulk read waiting");
    session.await.expect("task").expect("session opens");

    assert!(engine.is_open());
    let table = ReferenceTable::from_value(&engine.get_sync(&references).expect("table"));
    assert_eq!(table.len(), 250);
    assert_eq!(
        engine.reference_name(&ResourceKind::from("employee"), "E249"),
        Some("Employee 249".to_string())
    );
}

#[tokio::test]
async fn failed_prefetch_reports_key_and_a_retry_opens() {
    let remote = ScriptedRemote::new();
    let engine = engine(
        test_config(),
        Arc::new(MemoryStore::new()),
        remote.clone(),
        clock(),
    );
    let catalog = CacheKey::singleton("entity_types");
    remote.on_read(catalog.clone(), Err(RemoteError::Status { code: 503 }));

    let err = engine
        .start_session(SessionPlan::new([catalog.clone()]))
        .await
        .expect_err("prefetch failed");
    assert!(matches!(err, SessionError::Prefetch { ref key, .. } if key == &catalog.to_string()));
    assert!(!engine.is_open());
    assert_eq!(engine.gate_state().missing(), vec![catalog.clone()]);

    remote.on_read(catalog.clone(), Ok(ReadResponse::new(json!(["person"]))));
    engine
        .start_session(SessionPlan::new([catalog.clone()]))
        .await
        .expect("second attempt opens");
    assert!(engine.is_open());
}

#[tokio::test]
async fn prefetch_landing_before_a_concurrent_read_still_opens() {
    let remote = ScriptedRemote::new();
    let engine = Arc::new(engine(
        test_config(),
        Arc::new(MemoryStore::new()),
        remote.clone(),
        clock(),
    ));
    let catalog = CacheKey::singleton("entity_types");
    remote.on_read(catalog.clone(), Ok(ReadResponse::new(json!(["person"]))));
    remote.on_read(catalog.clone(), Ok(ReadResponse::new(json!(["person", "site"]))));

    let release_prefetch = remote.hold_read(catalog.clone());
    let session = tokio::spawn({
        let engine = engine.clone();
        let plan = SessionPlan::new([catalog.clone()]);
        async move { engine.start_session(plan).await }
    });
    settle().await;

    let release_read = remote.hold_read(catalog.clone());
    let read = tokio::spawn({
        let engine = engine.clone();
        let catalog = catalog.clone();
        async move { engine.read(&catalog).await }
    });
    settle().await;

    release_prefetch.send(()).expect("prefetch waiting");
    session.await.expect("task").expect("session opens");
    assert!(engine.is_open());
    assert_eq!(engine.get_sync(&catalog), Some(json!(["person"])));

    release_read.send(()).expect("read waiting");
    read.await.expect("task").expect("read lands");
    assert_eq!(engine.get_sync(&catalog), Some(json!(["person", "site"])));
}

#[tokio::test]
async fn ending_a_session_supersedes_its_prefetch() {
    let remote = ScriptedRemote::new();
    let engine = Arc::new(engine(
        test_config(),
        Arc::new(MemoryStore::new()),
        remote.clone(),
        clock(),
    ));
    let catalog = CacheKey::singleton("entity_types");
    remote.on_read(catalog.clone(), Ok(ReadResponse::new(json!(["person"]))));
    let release = remote.hold_read(catalog.clone());

    let session = tokio::spawn({
        let engine = engine.clone();
        let plan = SessionPlan::new([catalog.clone()]);
        async move { engine.start_session(plan).await }
    });
    settle().await;

    engine.end_session().await;
    release.send(()).expect("read waiting");

    let err = session.await.expect("task").expect_err("superseded");
    assert!(matches!(err, SessionError::Superseded));
    assert!(!engine.is_open());
}

#[tokio::test]
async fn wait_open_resolves_when_session_starts() {
    let remote = ScriptedRemote::new();
    let engine = Arc::new(engine(
        test_config(),
        Arc::new(MemoryStore::new()),
        remote.clone(),
        clock(),
    ));
    let catalog = CacheKey::singleton("status_catalog");
    remote.on_read(catalog.clone(), Ok(ReadResponse::new(json!({ "open": "Open" }))));

    let waiter = tokio::spawn({
        let engine = engine.clone();
        async move { engine.wait_open().await }
    });
    settle().await;
    assert!(!waiter.is_finished());

    engine
        .start_session(SessionPlan::new([catalog]))
        .await
        .expect("session opens");
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter released")
        .expect("task");
}
