mod common;

use std::time::Duration;

use chrono::Utc;
use common::*;
use pretty_assertions::assert_eq;
use rusty_collections::{
    new_id, ChangeAction, ChangeOrigin, CollectionError, Delta, KeyError, MemoryTransport,
    Record, SyncConfig, TransportError, Value,
};
use serde_json::json;
use tokio::sync::mpsc;

fn confirm(h: &Harness, id: &Value) {
    h.push(json!({"kind": "upsert", "items": [{"widgetId": id_text(id), "name": "confirmed"}]}));
}

#[tokio::test]
async fn test_widget_insert_then_server_unset() {
    let mut h = Harness::ready_with(vec![], SyncConfig::default()).await;
    h.transport.reply(&insert(), json!({}));

    let id = new_id();
    let item = widget(&id, "A");
    let key = h.key(&item);

    let pending = tokio::spawn({
        let widgets = h.collection.clone();
        async move { widgets.insert(vec![item]).await }
    });

    let local = h.next_change(ChangeOrigin::Local).await;
    assert_eq!(local.changes[0].action, ChangeAction::Insert);
    assert_eq!(
        h.collection.get(&key).unwrap().get("name"),
        Some(&Value::from("A"))
    );
    let before = h.collection.last_sync_time();

    h.push(json!({"kind": "update", "items": [{"widgetId": id_text(&id), "name": {"$unset": true}}]}));
    pending.await.unwrap().unwrap();

    assert_eq!(
        h.collection.get(&key).unwrap().get("name"),
        Some(&Value::from(""))
    );
    assert!(h.collection.last_sync_time() > before);
    assert_eq!(
        h.transport.calls_to(&insert()),
        vec![json!({"items": [{"widgetId": id_text(&id), "name": "A"}]})]
    );
}

#[tokio::test]
async fn test_update_is_visible_before_rpc_resolves() {
    let id = new_id();
    let mut h = Harness::ready_with(
        vec![json!({"widgetId": id_text(&id), "name": "old"})],
        SyncConfig::default(),
    )
    .await;
    let reply = h.transport.gate(&update());
    let key = h.key(&widget(&id, ""));

    let pending = tokio::spawn({
        let widgets = h.collection.clone();
        let id = id.clone();
        async move { widgets.update(vec![Delta::new().set("widgetId", id).set("name", "x")]).await }
    });

    h.next_change(ChangeOrigin::Local).await;
    assert_eq!(
        h.collection.get(&key).unwrap().get("name"),
        Some(&Value::from("x"))
    );

    reply.send(Ok(json!({}))).unwrap();
    confirm(&h, &id);
    pending.await.unwrap().unwrap();
    assert_eq!(
        h.transport.calls_to(&update()),
        vec![json!({"items": [{"widgetId": id_text(&id), "name": "x"}]})]
    );
}

#[tokio::test]
async fn test_settle_needs_a_new_batch() {
    let h = Harness::ready_with(vec![], SyncConfig::default()).await;
    let t0 = Utc::now();

    let early = tokio::time::timeout(Duration::from_millis(100), h.collection.wait_for_sync(t0)).await;
    assert!(early.is_err());

    confirm(&h, &new_id());
    h.collection.wait_for_sync(t0).await.unwrap();
    assert!(h.collection.last_sync_time().unwrap() > t0);
}

#[tokio::test]
async fn test_settle_timeout() {
    let config = SyncConfig::default().with_settle_timeout(Some(Duration::from_millis(20)));
    let h = Harness::ready_with(vec![], config).await;

    let err = h.collection.wait_for_sync(Utc::now()).await.unwrap_err();
    assert_eq!(
        err,
        CollectionError::SettleTimeout {
            entity: "widget".into(),
            waited: Duration::from_millis(20)
        }
    );
}

#[tokio::test]
async fn test_delete_is_optimistic() {
    let id = new_id();
    let mut h = Harness::ready_with(
        vec![json!({"widgetId": id_text(&id), "name": "doomed"})],
        SyncConfig::default(),
    )
    .await;
    h.transport.reply(&delete(), json!({}));
    let key = h.key(&widget(&id, ""));
    assert!(h.collection.contains(&key));

    let pending = tokio::spawn({
        let widgets = h.collection.clone();
        let fields = Record::new().with("widgetId", id.clone());
        async move { widgets.delete(vec![fields]).await }
    });
    let local = h.next_change(ChangeOrigin::Local).await;
    assert_eq!(local.changes[0].action, ChangeAction::Delete);
    assert!(!h.collection.contains(&key));

    h.push(json!({"kind": "delete", "items": [{"widgetId": id_text(&id)}]}));
    pending.await.unwrap().unwrap();
    assert_eq!(
        h.transport.calls_to(&delete()),
        vec![json!({"items": [{"widgetId": id_text(&id)}]})]
    );
}

#[tokio::test]
async fn test_missing_method_is_unsupported() {
    let transport = MemoryTransport::new();
    transport.reply(&list(), json!({"items": []}));
    let h = Harness::start(&transport, read_mostly_schema(), SyncConfig::default());
    h.collection.ready().await.unwrap();

    let id = new_id();
    let err = h.collection.insert(vec![widget(&id, "nope")]).await.unwrap_err();
    assert_eq!(
        err,
        CollectionError::Unsupported {
            entity: "widget".into(),
            operation: "insert"
        }
    );
    assert!(h.collection.is_empty());
    assert!(h.transport.calls_to(&insert()).is_empty());
}

#[tokio::test]
async fn test_missing_key_field_rejected_before_local_change() {
    let h = Harness::ready_with(vec![], SyncConfig::default()).await;
    h.transport.reply(&insert(), json!({}));

    let err = h
        .collection
        .insert(vec![
            widget(&new_id(), "fine"),
            Record::new().with("name", "keyless"),
        ])
        .await
        .unwrap_err();

    assert_eq!(
        err,
        CollectionError::Key(KeyError::MissingField {
            entity: "widget".into(),
            field: "widgetId".into()
        })
    );
    assert!(h.collection.is_empty());
    assert!(h.transport.calls_to(&insert()).is_empty());
}

#[tokio::test]
async fn test_failed_rpc_keeps_optimistic_state() {
    let h = Harness::ready_with(vec![], SyncConfig::default()).await;
    h.transport
        .on_unary(&insert(), |_| Err(TransportError::unavailable("offline")));

    let item = widget(&new_id(), "draft");
    let key = h.key(&item);
    let err = h.collection.insert(vec![item]).await.unwrap_err();

    assert!(matches!(err, CollectionError::Transport(_)));
    assert!(h.collection.contains(&key));
}

#[tokio::test]
async fn test_update_for_unknown_key_still_sends() {
    let h = Harness::ready_with(vec![], SyncConfig::default()).await;
    let (sent_tx, mut sent) = mpsc::unbounded_channel();
    h.transport.on_unary(&update(), move |input| {
        let _ = sent_tx.send(input.clone());
        Ok(json!({}))
    });
    let id = new_id();

    let pending = tokio::spawn({
        let widgets = h.collection.clone();
        let id = id.clone();
        async move { widgets.update(vec![Delta::new().set("widgetId", id).set("name", "?")]).await }
    });

    let payload = sent.recv().await.unwrap();
    assert_eq!(
        payload,
        json!({"items": [{"widgetId": id_text(&id), "name": "?"}]})
    );
    assert!(h.collection.is_empty());

    confirm(&h, &id);
    pending.await.unwrap().unwrap();
    assert_eq!(h.collection.len(), 1);
}

#[tokio::test]
async fn test_paced_updates_coalesce_per_key() {
    let id = new_id();
    let config = SyncConfig::default().with_pace_window(Duration::from_millis(50));
    let h = Harness::ready_with(
        vec![json!({"widgetId": id_text(&id), "name": ""})],
        config,
    )
    .await;
    let key = h.key(&widget(&id, ""));

    let (sent_tx, mut sent) = mpsc::unbounded_channel();
    h.transport.on_unary(&update(), move |input| {
        let _ = sent_tx.send(input.clone());
        Ok(json!({}))
    });

    let typing = tokio::spawn({
        let widgets = h.collection.clone();
        let id = id.clone();
        async move {
            let keystroke = |name: &str| Delta::new().set("widgetId", id.clone()).set("name", name);
            let (a, b, c) = futures::join!(
                widgets.update_paced(vec![keystroke("a")]),
                widgets.update_paced(vec![keystroke("ab")]),
                widgets.update_paced(vec![keystroke("abc")]),
            );
            a.and(b).and(c)
        }
    });

    let payload = sent.recv().await.unwrap();
    assert_eq!(
        payload,
        json!({"items": [{"widgetId": id_text(&id), "name": "abc"}]})
    );
    assert_eq!(
        h.collection.get(&key).unwrap().get("name"),
        Some(&Value::from("abc"))
    );

    confirm(&h, &id);
    typing.await.unwrap().unwrap();
    assert_eq!(h.transport.calls_to(&update()).len(), 1);
    assert_eq!(h.collection.pending_paced(), 0);
}

#[tokio::test]
async fn test_flush_paced_sends_immediately() {
    let id = new_id();
    let config = SyncConfig::default().with_pace_window(Duration::from_secs(3600));
    let mut h = Harness::ready_with(
        vec![json!({"widgetId": id_text(&id), "name": ""})],
        config,
    )
    .await;
    h.transport.reply(&update(), json!({}));

    let typing = tokio::spawn({
        let widgets = h.collection.clone();
        let id = id.clone();
        async move {
            widgets
                .update_paced(vec![Delta::new().set("widgetId", id).set("name", "draft")])
                .await
        }
    });
    h.next_change(ChangeOrigin::Local).await;
    assert_eq!(h.collection.pending_paced(), 1);
    assert!(h.transport.calls_to(&update()).is_empty());

    h.collection.flush_paced().await.unwrap();
    assert_eq!(h.collection.pending_paced(), 0);
    assert_eq!(h.transport.calls_to(&update()).len(), 1);

    confirm(&h, &id);
    typing.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_partial_insert_stores_zero_values_locally() {
    let mut h = Harness::ready_with(vec![], SyncConfig::default()).await;
    h.transport.reply(&insert(), json!({}));

    let id = new_id();
    let item = Record::new().with("widgetId", id.clone());
    let key = h.key(&item);

    let pending = tokio::spawn({
        let widgets = h.collection.clone();
        async move { widgets.insert(vec![item]).await }
    });

    h.next_change(ChangeOrigin::Local).await;
    let stored = h.collection.get(&key).unwrap();
    assert_eq!(stored.get("name"), Some(&Value::from("")));
    assert_eq!(stored.get("dims"), Some(&Value::Null));

    h.push(json!({"kind": "update", "items": [{"widgetId": id_text(&id), "name": {"$unset": true}}]}));
    pending.await.unwrap().unwrap();

    assert_eq!(
        h.collection.get(&key).unwrap().get("name"),
        Some(&Value::from(""))
    );
    assert_eq!(
        h.transport.calls_to(&insert()),
        vec![json!({"items": [{"widgetId": id_text(&id)}]})]
    );
}

#[tokio::test]
async fn test_null_or_short_identifier_rejected() {
    let h = Harness::ready_with(vec![], SyncConfig::default()).await;
    h.transport.reply(&insert(), json!({}));

    let err = h
        .collection
        .insert(vec![Record::new().with("widgetId", Value::Null)])
        .await
        .unwrap_err();
    assert!(matches!(err, CollectionError::Key(KeyError::MissingField { .. })));

    let err = h
        .collection
        .insert(vec![Record::new().with("widgetId", vec![1u8, 2, 3])])
        .await
        .unwrap_err();
    assert!(matches!(err, CollectionError::Key(KeyError::InvalidField { .. })));

    assert!(h.collection.is_empty());
    assert!(h.transport.calls_to(&insert()).is_empty());
}

#[tokio::test]
async fn test_paced_clear_then_nested_edit_splits_rounds() {
    let id = new_id();
    let config = SyncConfig::default().with_pace_window(Duration::from_millis(50));
    let h = Harness::ready_with(
        vec![json!({"widgetId": id_text(&id), "name": "box", "dims": {"w": 10, "h": 20}})],
        config,
    )
    .await;
    let key = h.key(&widget(&id, ""));

    let (sent_tx, mut sent) = mpsc::unbounded_channel();
    h.transport.on_unary(&update(), move |input| {
        let _ = sent_tx.send(input.clone());
        Ok(json!({}))
    });

    let editing = tokio::spawn({
        let widgets = h.collection.clone();
        let id = id.clone();
        async move {
            let (cleared, resized) = futures::join!(
                widgets.update_paced(vec![Delta::new().set("widgetId", id.clone()).unset("dims")]),
                widgets.update_paced(vec![Delta::new()
                    .set("widgetId", id.clone())
                    .merge("dims", Delta::new().set("w", 1i64))]),
            );
            cleared.and(resized)
        }
    });

    assert_eq!(
        sent.recv().await.unwrap(),
        json!({"items": [{"widgetId": id_text(&id), "dims": {"$unset": true}}]})
    );
    assert_eq!(
        sent.recv().await.unwrap(),
        json!({"items": [{"widgetId": id_text(&id), "dims": {"w": 1}}]})
    );
    assert_eq!(
        h.collection.get(&key).unwrap().get("dims"),
        Some(&Value::Record(Record::new().with("w", 1i64).with("h", 0i64)))
    );

    confirm(&h, &id);
    editing.await.unwrap().unwrap();
    assert_eq!(h.collection.pending_paced(), 0);
}

#[tokio::test]
async fn test_flush_keeps_paced_rounds_in_order() {
    let id = new_id();
    let config = SyncConfig::default().with_pace_window(Duration::from_secs(3600));
    let h = Harness::ready_with(
        vec![json!({"widgetId": id_text(&id), "name": "box", "dims": {"w": 10, "h": 20}})],
        config,
    )
    .await;
    let key = h.key(&widget(&id, ""));

    let (sent_tx, mut sent) = mpsc::unbounded_channel();
    h.transport.on_unary(&update(), move |input| {
        let _ = sent_tx.send(input.clone());
        Ok(json!({}))
    });

    let editing = tokio::spawn({
        let widgets = h.collection.clone();
        let id = id.clone();
        async move {
            let (cleared, resized, flushed) = futures::join!(
                widgets.update_paced(vec![Delta::new().set("widgetId", id.clone()).unset("dims")]),
                widgets.update_paced(vec![Delta::new()
                    .set("widgetId", id.clone())
                    .merge("dims", Delta::new().set("w", 1i64))]),
                widgets.flush_paced(),
            );
            cleared.and(resized).and(flushed)
        }
    });

    assert_eq!(
        sent.recv().await.unwrap(),
        json!({"items": [{"widgetId": id_text(&id), "dims": {"$unset": true}}]})
    );
    assert_eq!(
        sent.recv().await.unwrap(),
        json!({"items": [{"widgetId": id_text(&id), "dims": {"w": 1}}]})
    );
    assert_eq!(h.collection.pending_paced(), 0);

    confirm(&h, &id);
    editing.await.unwrap().unwrap();
    let stored = h.collection.get(&key).unwrap();
    assert_eq!(stored.get("name"), Some(&Value::from("confirmed")));
}
