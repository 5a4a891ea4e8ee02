//! Storage contract tests
//!
//! Every behavioural guarantee of `StorageInstance` is checked against the
//! memory, LMDB and remote backends with the same assertions.

mod common;

use common::{ALL_BACKENDS, Harness};
use docsync_core::document::Checkpoint;
use docsync_core::query::{MangoQuery, prepare_count_query, prepare_query};
use docsync_core::storage::{
    BulkWriteRow, CountMode, Operation, WriteErrorKind, count_all_documents, get_single_document,
};
use docsync_core::testing::fixtures::{self, human, update_row};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_insert_update_and_conflict() {
    for backend in ALL_BACKENDS {
        let harness = Harness::new(backend);
        let instance = harness.humans("humans").await;
        let inserted = fixtures::insert_humans(instance.as_ref(), &[("alice", 30)]).await;
        assert_eq!(inserted[0].rev, "1-fixture");

        let v1 = inserted[0].clone();
        let response = instance
            .bulk_write(vec![update_row(&v1, |d| d.data["age"] = json!(31))], "test")
            .await
            .unwrap();
        let v2 = response.success["alice"].clone();
        assert_eq!(v2.rev, "2-fixture", "{backend:?}");

        let stale = instance
            .bulk_write(vec![update_row(&v1, |d| d.data["age"] = json!(99))], "test")
            .await
            .unwrap();
        let err = &stale.error["alice"];
        assert_eq!(err.status, 409, "{backend:?}");
        assert_eq!(err.kind, WriteErrorKind::Conflict);
        assert_eq!(err.document_in_db.as_ref().unwrap().rev, v2.rev);

        let stored = get_single_document(instance.as_ref(), "alice").await.unwrap().unwrap();
        assert_eq!(stored.data["age"], json!(31), "{backend:?}");
        instance.remove().await.unwrap();
    }
}

#[tokio::test]
async fn test_partial_batch_keeps_valid_rows() {
    for backend in ALL_BACKENDS {
        let harness = Harness::new(backend);
        let instance = harness.humans("humans").await;
        fixtures::insert_humans(instance.as_ref(), &[("a", 1)]).await;

        let response = instance
            .bulk_write(
                vec![BulkWriteRow::insert(human("a", 2)), BulkWriteRow::insert(human("b", 3))],
                "test",
            )
            .await
            .unwrap();
        assert_eq!(response.success.keys().collect::<Vec<_>>(), vec!["b"], "{backend:?}");
        assert_eq!(response.error.keys().collect::<Vec<_>>(), vec!["a"], "{backend:?}");
        assert_eq!(count_all_documents(instance.as_ref()).await.unwrap(), 2);
    }
}

#[tokio::test]
async fn test_primary_key_change_is_rejected() {
    for backend in ALL_BACKENDS {
        let harness = Harness::new(backend);
        let instance = harness.humans("humans").await;
        let stored = fixtures::insert_humans(instance.as_ref(), &[("a", 1)]).await;

        let row = update_row(&stored[0], |d| d.data["id"] = json!("z"));
        let response = instance.bulk_write(vec![row], "test").await.unwrap();
        let err = response.error.values().next().unwrap();
        assert_eq!(err.status, 422, "{backend:?}");
        assert_eq!(err.kind, WriteErrorKind::PrimaryKeyChanged);
    }
}

#[tokio::test]
async fn test_query_and_count_skip_tombstones() {
    for backend in ALL_BACKENDS {
        let harness = Harness::new(backend);
        let instance = harness.humans("humans").await;
        let stored = fixtures::insert_humans(
            instance.as_ref(),
            &[("a", 50), ("b", 20), ("c", 35), ("d", 41)],
        )
        .await;
        instance
            .bulk_write(vec![update_row(&stored[3], |d| d.deleted = true)], "test")
            .await
            .unwrap();

        let query = MangoQuery::from_value(json!({
            "selector": { "age": { "$gte": 30 } },
            "sort": [{ "age": "desc" }]
        }))
        .unwrap();
        let prepared = prepare_query(instance.schema(), query).unwrap();
        let found = instance.query(&prepared).await.unwrap();
        let ids: Vec<_> = found.iter().map(|d| d.primary("id").unwrap()).collect();
        assert_eq!(ids, vec!["a", "c"], "{backend:?}");

        let count = prepare_count_query(
            instance.schema(),
            MangoQuery::with_selector(json!({ "age": { "$gte": 30 } })).unwrap(),
        )
        .unwrap();
        let counted = instance.count(&count).await.unwrap();
        assert_eq!(counted.count, 2, "{backend:?}");
        assert_eq!(counted.mode, CountMode::Fast, "{backend:?}");
    }
}

#[tokio::test]
async fn test_keys_outside_the_basic_plane_are_indexed() {
    for backend in ALL_BACKENDS {
        let harness = Harness::new(backend);
        let instance = harness.humans("humans").await;
        fixtures::insert_humans(instance.as_ref(), &[("plain", 1), ("\u{1F600}", 2)]).await;

        let prepared = prepare_query(instance.schema(), MangoQuery::default()).unwrap();
        let found = instance.query(&prepared).await.unwrap();
        let ids: Vec<_> = found.iter().map(|d| d.primary("id").unwrap()).collect();
        assert_eq!(ids, vec!["plain", "\u{1F600}"], "{backend:?}");
        assert_eq!(count_all_documents(instance.as_ref()).await.unwrap(), 2, "{backend:?}");
    }
}

#[tokio::test]
async fn test_changed_documents_pages_in_order() {
    for backend in ALL_BACKENDS {
        let harness = Harness::new(backend);
        let instance = harness.humans("humans").await;
        for (id, age) in [("x", 1), ("y", 2), ("z", 3)] {
            fixtures::insert_humans(instance.as_ref(), &[(id, age)]).await;
        }

        let mut seen = Vec::new();
        let mut checkpoint: Option<Checkpoint> = None;
        loop {
            let page = instance
                .get_changed_documents_since(2, checkpoint.as_ref())
                .await
                .unwrap();
            if page.documents.is_empty() {
                assert_eq!(page.checkpoint, checkpoint, "{backend:?}");
                break;
            }
            seen.extend(
                page.documents
                    .iter()
                    .map(|d| d.primary("id").unwrap().to_string()),
            );
            checkpoint = page.checkpoint;
        }
        assert_eq!(seen, vec!["x", "y", "z"], "{backend:?}");
    }
}

#[tokio::test]
async fn test_cleanup_purges_tombstones() {
    for backend in ALL_BACKENDS {
        let harness = Harness::new(backend);
        let instance = harness.humans("humans").await;
        let stored = fixtures::insert_humans(instance.as_ref(), &[("a", 1), ("b", 2)]).await;
        instance
            .bulk_write(vec![update_row(&stored[0], |d| d.deleted = true)], "test")
            .await
            .unwrap();

        // Too young to purge with the default age.
        assert!(instance.cleanup(Duration::from_secs(3600)).await.unwrap());
        assert!(get_single_document(instance.as_ref(), "a").await.unwrap().is_some());
        let live = instance
            .find_documents_by_id(&["a".to_string(), "b".to_string()], false)
            .await
            .unwrap();
        assert_eq!(live.keys().collect::<Vec<_>>(), vec!["b"], "{backend:?}");

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(instance.cleanup(Duration::ZERO).await.unwrap(), "{backend:?}");
        assert!(get_single_document(instance.as_ref(), "a").await.unwrap().is_none());
        assert!(get_single_document(instance.as_ref(), "b").await.unwrap().is_some());
    }
}

#[tokio::test]
async fn test_change_stream_delivers_every_bulk() {
    for backend in ALL_BACKENDS {
        let harness = Harness::new(backend);
        let instance = harness.humans("humans").await;
        let mut stream = instance.change_stream();

        let stored = fixtures::insert_humans(instance.as_ref(), &[("a", 1), ("b", 2)]).await;
        let updated = instance
            .bulk_write(vec![update_row(&stored[0], |d| d.data["age"] = json!(5))], "test")
            .await
            .unwrap();
        instance
            .bulk_write(
                vec![update_row(&updated.success["a"], |d| d.deleted = true)],
                "test",
            )
            .await
            .unwrap();

        let mut operations = Vec::new();
        let mut last: Option<Checkpoint> = None;
        for _ in 0..3 {
            let bulk = tokio::time::timeout(Duration::from_secs(2), stream.next())
                .await
                .unwrap_or_else(|_| panic!("{backend:?}: change stream stalled"))
                .unwrap();
            let checkpoint = bulk.checkpoint.clone().unwrap();
            if let Some(last) = &last {
                assert!(
                    (last.lwt, last.id.as_str()) <= (checkpoint.lwt, checkpoint.id.as_str()),
                    "{backend:?}: checkpoint went backwards"
                );
            }
            last = Some(checkpoint);
            operations.extend(bulk.events.iter().map(|e| (e.document_id.clone(), e.operation)));
        }
        assert_eq!(
            operations,
            vec![
                ("a".to_string(), Operation::Insert),
                ("b".to_string(), Operation::Insert),
                ("a".to_string(), Operation::Update),
                ("a".to_string(), Operation::Delete),
            ],
            "{backend:?}"
        );
    }
}

#[tokio::test]
async fn test_replayed_bulk_changes_nothing() {
    for backend in ALL_BACKENDS {
        let harness = Harness::new(backend);
        let instance = harness.humans("humans").await;
        let rows = vec![BulkWriteRow::insert(human("a", 1)), BulkWriteRow::insert(human("b", 2))];
        let first = instance.bulk_write(rows.clone(), "test").await.unwrap();
        assert_eq!(first.success.len(), 2);

        let replay = instance.bulk_write(rows, "test").await.unwrap();
        assert!(replay.success.is_empty(), "{backend:?}");
        assert_eq!(replay.error.len(), 2);
        for (id, err) in &replay.error {
            assert_eq!(err.status, 409);
            assert_eq!(err.document_in_db.as_ref(), Some(&first.success[id]));
        }
        assert_eq!(count_all_documents(instance.as_ref()).await.unwrap(), 2);
    }
}

#[tokio::test]
async fn test_same_writes_store_identical_documents() {
    for backend in ALL_BACKENDS {
        let mut doc = human("a", 7);
        doc.meta.lwt = 1_700_000_000_000.0;
        let mut stored = Vec::new();
        for _ in 0..2 {
            let harness = Harness::new(backend);
            let instance = harness.humans("humans").await;
            let first = instance
                .bulk_write(vec![BulkWriteRow::insert(doc.clone())], "test")
                .await
                .unwrap();
            assert_eq!(first.success.len(), 1, "{backend:?}");
            let replay = instance
                .bulk_write(vec![BulkWriteRow::insert(doc.clone())], "test")
                .await
                .unwrap();
            assert!(replay.success.is_empty(), "{backend:?}");

            let read = get_single_document(instance.as_ref(), "a").await.unwrap().unwrap();
            stored.push(serde_json::to_string(&read).unwrap());
        }
        assert_eq!(stored[0], stored[1], "{backend:?}");
        assert_eq!(stored[0], serde_json::to_string(&doc).unwrap(), "{backend:?}");
    }
}

#[tokio::test]
async fn test_closed_instance_rejects_operations() {
    for backend in ALL_BACKENDS {
        let harness = Harness::new(backend);
        let instance = harness.humans("humans").await;
        instance.close().await.unwrap();
        assert!(
            get_single_document(instance.as_ref(), "a").await.is_err(),
            "{backend:?}"
        );
    }
}
