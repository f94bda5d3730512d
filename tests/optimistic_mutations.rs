mod support;

use std::sync::Arc;
use std::time::Duration;

use coherence::application::engine::CoherenceEngine;
use coherence::application::repos::RemoteError;
use coherence::cache::{Mutation, MutationOptions};
use coherence::domain::keys::{CacheKey, ResourceKind};
use coherence::domain::payload::{list_rows, row_id};
use coherence::infra::memory::MemoryStore;
use coherence_wire::{ReadResponse, WriteOperation};
use serde_json::{Map, Value, json};

use support::{ScriptedRemote, clock, engine, eventually, row_field, test_config};

fn project() -> ResourceKind {
    ResourceKind::from("project")
}

fn rename(id: &str, name: &str) -> Mutation {
    let mut changes = Map::new();
    changes.insert("name".to_string(), json!(name));
    Mutation::Update {
        id: id.to_string(),
        changes,
    }
}

fn row_ids(list: &Value) -> Vec<String> {
    list_rows(list)
        .map(|rows| rows.iter().filter_map(row_id).collect())
        .unwrap_or_default()
}

async fn seeded(remote: &Arc<ScriptedRemote>) -> (Arc<CoherenceEngine>, CacheKey) {
    let engine = Arc::new(engine(
        test_config(),
        Arc::new(MemoryStore::new()),
        remote.clone(),
        clock(),
    ));
    let list = CacheKey::list("project", json!({}));
    remote.on_read(
        list.clone(),
        Ok(ReadResponse::new(json!([
            { "id": "P1", "name": "Alpha" },
            { "id": "P2", "name": "Gamma" }
        ]))
        .with_total(2)),
    );
    engine.fetch(&list).await.expect("list cached");
    (engine, list)
}

#[tokio::test]
async fn same_resource_mutations_queue_while_others_proceed() {
    let remote = ScriptedRemote::new();
    let (engine, list) = seeded(&remote).await;

    let release = remote.hold_write();
    let first = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .mutate(project(), rename("P1", "Beta"), MutationOptions::default())
                .await
        }
    });
    eventually(|| remote.write_log().len() == 1).await;

    let second = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .mutate(project(), rename("P1", "Delta"), MutationOptions::default())
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(remote.write_log().len(), 1, "second P1 write dispatched early");

    remote.on_write(Ok(json!({ "id": "P2", "name": "Omega" })));
    engine
        .mutate(project(), rename("P2", "Omega"), MutationOptions::default())
        .await
        .expect("other resource is not blocked");

    remote.on_write(Ok(json!({ "id": "P1", "name": "Beta" })));
    remote.on_write(Ok(json!({ "id": "P1", "name": "Delta" })));
    release.send(()).expect("first write waiting");
    first.await.expect("task").expect("first commits");
    second.await.expect("task").expect("second commits");

    let log = remote.write_log();
    assert_eq!(log.len(), 3);
    assert_eq!(log[1].id.as_deref(), Some("P2"));
    assert_eq!(log[2].payload["name"], json!("Delta"));

    let value = engine.get_sync(&list).expect("list");
    assert_eq!(row_field(&value, "P1", "name"), Some(json!("Delta")));
    assert_eq!(row_field(&value, "P2", "name"), Some(json!("Omega")));
    assert!(engine.pending_mutations().is_empty());
}

#[tokio::test]
async fn created_row_is_replaced_in_place_with_server_id() {
    let remote = ScriptedRemote::new();
    let (engine, list) = seeded(&remote).await;

    let release = remote.hold_write();
    remote.on_write(Ok(json!({ "id": "P9", "name": "Nova", "owner": "E1" })));
    let create = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .mutate(
                    project(),
                    Mutation::Create {
                        temp_id: "tmp-1".to_string(),
                        record: json!({ "name": "Nova" }),
                    },
                    MutationOptions::default(),
                )
                .await
        }
    });

    eventually(|| {
        engine
            .get_sync(&list)
            .is_some_and(|value| row_ids(&value) == ["P1", "P2", "tmp-1"])
    })
    .await;
    release.send(()).expect("create waiting");
    let outcome = create.await.expect("task").expect("created");

    assert_eq!(outcome.id, "P9");
    let value = engine.get_sync(&list).expect("list");
    assert_eq!(row_ids(&value), ["P1", "P2", "P9"]);
    assert_eq!(row_field(&value, "P9", "owner"), Some(json!("E1")));
    assert_eq!(
        engine.get_sync(&CacheKey::detail("project", "P9")),
        Some(json!({ "id": "P9", "name": "Nova", "owner": "E1" }))
    );

    let log = remote.write_log();
    assert_eq!(log[0].operation, WriteOperation::Create);
    assert!(log[0].payload.get("id").is_none());
}

#[tokio::test]
async fn failed_create_removes_synthetic_row() {
    let remote = ScriptedRemote::new();
    let (engine, list) = seeded(&remote).await;
    let before = engine.get_sync(&list).expect("list");

    remote.on_write(Err(RemoteError::Status { code: 422 }));
    engine
        .mutate(
            project(),
            Mutation::Create {
                temp_id: "tmp-2".to_string(),
                record: json!({ "name": "Draft" }),
            },
            MutationOptions::default(),
        )
        .await
        .expect_err("rejected");

    let after = engine.get_sync(&list).expect("list");
    assert_eq!(row_ids(&after), ["P1", "P2"]);
    assert_eq!(after, before);
}

#[tokio::test]
async fn commit_lands_canonical_record_unless_kept_optimistic() {
    let remote = ScriptedRemote::new();
    let (engine, list) = seeded(&remote).await;
    let detail = CacheKey::detail("project", "P1");
    remote.on_read(
        detail.clone(),
        Ok(ReadResponse::new(json!({ "id": "P1", "name": "Alpha" }))),
    );
    engine.fetch(&detail).await.expect("detail");

    let canonical = json!({ "id": "P1", "name": "Beta", "updated_by": "E2" });
    remote.on_write(Ok(canonical.clone()));
    engine
        .mutate(project(), rename("P1", "Beta"), MutationOptions::default())
        .await
        .expect("committed");
    let value = engine.get_sync(&list).expect("list");
    assert_eq!(row_field(&value, "P1", "updated_by"), Some(json!("E2")));
    assert_eq!(engine.get_sync(&detail), Some(canonical));

    remote.on_write(Ok(json!({ "id": "P1", "name": "Server" })));
    engine
        .mutate(
            project(),
            rename("P1", "Kept"),
            MutationOptions {
                keep_optimistic: true,
            },
        )
        .await
        .expect("committed");
    let value = engine.get_sync(&list).expect("list");
    assert_eq!(row_field(&value, "P1", "name"), Some(json!("Kept")));
}

#[tokio::test]
async fn remove_drops_rows_and_detail_on_success() {
    let remote = ScriptedRemote::new();
    let (engine, list) = seeded(&remote).await;
    let detail = CacheKey::detail("project", "P2");
    remote.on_read(
        detail.clone(),
        Ok(ReadResponse::new(json!({ "id": "P2", "name": "Gamma" }))),
    );
    engine.fetch(&detail).await.expect("detail");

    remote.on_write(Ok(Value::Null));
    engine
        .mutate(
            project(),
            Mutation::Remove {
                id: "P2".to_string(),
            },
            MutationOptions::default(),
        )
        .await
        .expect("removed");

    assert_eq!(row_ids(&engine.get_sync(&list).expect("list")), ["P1"]);
    assert!(engine.get_sync(&detail).is_none());
}
