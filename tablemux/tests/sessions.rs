//! Session lifecycle, port isolation and push subscriptions, driven through
//! real clients.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{connect, eventually, init_tracing, server_with_table};
use serde_json::json;
use tablemux::wire::envelope::TableOptions;
use tablemux::{
    ClientError, ClientId, ColumnarCodec, FilterOp, Filter, JsonColumnarCodec, PushEvent,
    PushKind, Sink, SortOrder, UpdateMode, ViewConfig,
};
use tokio::sync::mpsc;

fn channel() -> (Sink<PushEvent>, mpsc::UnboundedReceiver<PushEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Sink::Channel(tx), rx)
}

async fn next_push(rx: &mut mpsc::UnboundedReceiver<PushEvent>) -> PushEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("push in time")
        .expect("push")
}

#[tokio::test]
async fn test_read_after_write() {
    init_tracing();
    let server = server_with_table();
    let (client, _conn) = connect(&server).await;

    let table = client
        .create_table("fresh", &json!({"a": "integer"}), TableOptions::default())
        .await
        .expect("create");
    let view = table.view("fresh_view", ViewConfig::default()).await.expect("view");
    table.update(&json!({"a": [1]})).await.expect("update");

    let records = view.to_records().await.expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("a"), Some(&json!(1)));
    assert_eq!(client.hosted_tables().await.expect("names"), vec!["fresh", "t"]);
}

#[tokio::test]
async fn test_closing_one_session_leaves_the_other_alone() {
    init_tracing();
    let server = server_with_table();
    let (s1, _c1) = connect(&server).await;
    let (s2, _c2) = connect(&server).await;

    let v1 = s1.table("t").view("v1", ViewConfig::default()).await.expect("v1");
    let v2 = s2.table("t").view("v2", ViewConfig::default()).await.expect("v2");
    let (sink, _rx) = channel();
    v2.on_update(UpdateMode::Plain, sink).await.expect("s2 watches v2");
    let (sink, _rx1) = channel();
    v1.on_update(UpdateMode::Plain, sink).await.expect("s1 watches v1");
    assert_eq!(server.session_count(), 2);

    s1.close().await;
    eventually(|| server.view("v1").is_none()).await;
    eventually(|| server.session_count() == 1).await;

    let t = s2.table("t");
    t.update(&json!([{"id": 4, "name": "d"}])).await.expect("update");
    let records = v2.to_records().await.expect("v2 survives");
    assert_eq!(records.len(), 4);
    assert_eq!(server.view("v2").expect("v2").callback_count(), 1);
    assert_eq!(t.size().await.expect("size"), 4);
    assert!(matches!(
        v1.to_records().await,
        Err(ClientError::Disconnected { .. })
    ));
}

#[tokio::test]
async fn test_dropped_connection_cleans_up_session() {
    init_tracing();
    let server = server_with_table();
    let (client, conn) = connect(&server).await;
    client
        .table("t")
        .view("temp", ViewConfig::default())
        .await
        .expect("view");
    assert!(server.view("temp").is_some());

    drop(client);
    conn.await.expect("join").expect("clean close");
    assert!(server.view("temp").is_none());
    assert_eq!(server.session_count(), 0);
    assert!(server.table("t").is_some());
}

#[tokio::test]
async fn test_only_the_flushed_port_notifies() {
    init_tracing();
    let server = server_with_table();
    let (client, _conn) = connect(&server).await;
    let table = client.table("t");
    let ports = [
        table.make_port().await.expect("port"),
        table.make_port().await.expect("port"),
        table.make_port().await.expect("port"),
    ];
    assert_eq!(ports, [1, 2, 3]);

    let view = table.view("watched", ViewConfig::default()).await.expect("view");
    let (sink, mut rx) = channel();
    let subscription = view.on_update(UpdateMode::Plain, sink).await.expect("subscribe");

    table
        .update_port(&json!([{"id": 10, "name": "x"}]), 2)
        .await
        .expect("update");
    let push = next_push(&mut rx).await;
    assert_eq!(push.id, subscription.id());
    assert_eq!(push.event, PushKind::Update);
    assert_eq!(push.port_id(), Some(2));

    table
        .update_port(&json!([{"id": 11, "name": "y"}]), 1)
        .await
        .expect("update");
    // Pushes are FIFO per subscription, so a stray port-2 event would show up here.
    assert_eq!(next_push(&mut rx).await.port_id(), Some(1));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_row_mode_delivers_only_the_batch() {
    init_tracing();
    let server = server_with_table();
    let (client, _conn) = connect(&server).await;
    let table = client.table("t");
    let config = ViewConfig::default()
        .with_filter(Filter::new("id", FilterOp::Gt, json!(1)))
        .with_sort("id", SortOrder::Desc);
    let view = table.view("rows", config).await.expect("view");
    assert_eq!(view.num_rows().await.expect("rows"), 2);

    let (sink, mut rx) = channel();
    view.on_update(UpdateMode::Row, sink).await.expect("subscribe");
    table
        .update(&json!([{"id": 0, "name": "skip"}, {"id": 7, "name": "keep"}]))
        .await
        .expect("update");

    let push = next_push(&mut rx).await;
    let delta = push.payload.expect("row delta");
    let rows = JsonColumnarCodec
        .decode(&delta)
        .expect("decode")
        .into_rows()
        .expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some(&json!("keep")));
}

#[tokio::test]
async fn test_unsubscribe_stops_pushes() {
    init_tracing();
    let server = server_with_table();
    let (client, _conn) = connect(&server).await;
    let table = client.table("t");
    let view = table.view("v", ViewConfig::default()).await.expect("view");

    let (sink, mut first_rx) = channel();
    let first = view.on_update(UpdateMode::Plain, sink).await.expect("first");
    let counted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&counted);
    let (tx, mut second_rx) = mpsc::unbounded_channel();
    let handler = Sink::handler(move |event: PushEvent| {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(event);
    });
    view.on_update(UpdateMode::Plain, handler).await.expect("second");

    first.unsubscribe().await.expect("unsubscribe");
    assert_eq!(server.view("v").expect("v").callback_count(), 1);

    table.update(&json!([{"id": 9}])).await.expect("update");
    next_push(&mut second_rx).await;
    assert_eq!(counted.load(Ordering::SeqCst), 1);
    assert!(first_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_delete_notifications() {
    init_tracing();
    let server = server_with_table();
    let (client, _conn) = connect(&server).await;
    let table = client.table("t");
    let view = table.view("short_lived", ViewConfig::default()).await.expect("view");

    let (sink, mut view_rx) = channel();
    view.on_delete(sink).await.expect("view on_delete");
    let (sink, mut table_rx) = channel();
    table.on_delete(sink).await.expect("table on_delete");

    // Views depend on the table.
    let err = table.delete().await.expect_err("blocked");
    assert!(err.to_string().contains("dependent view"), "{err}");

    view.delete().await.expect("delete view");
    assert_eq!(next_push(&mut view_rx).await.event, PushKind::Delete);

    table.delete().await.expect("delete table");
    assert_eq!(next_push(&mut table_rx).await.event, PushKind::Delete);
    assert!(client.hosted_tables().await.expect("names").is_empty());
}

#[tokio::test]
async fn test_cannot_delete_another_sessions_view() {
    init_tracing();
    let server = server_with_table();
    let (owner, _c1) = connect(&server).await;
    let (other, _c2) = connect(&server).await;

    owner.table("t").view("mine", ViewConfig::default()).await.expect("view");
    let theirs = other.table("t").view("theirs", ViewConfig::default()).await.expect("view");

    // Views are addressed by name, so any session can read one.
    let borrowed = other.view("mine");
    assert_eq!(borrowed.num_rows().await.expect("rows"), 3);
    let err = borrowed.delete().await.expect_err("not owner");
    assert!(matches!(err, ClientError::Method { .. }));
    assert!(server.view("mine").is_some());

    theirs.delete().await.expect("own view");
    assert!(server.view("theirs").is_none());
}

#[tokio::test]
async fn test_method_errors_do_not_end_the_session() {
    init_tracing();
    let server = server_with_table();
    let (client, _conn) = connect(&server).await;

    let err = client.table("missing").size().await.expect_err("unknown table");
    assert_eq!(
        err,
        ClientError::Method {
            message: "unknown table 'missing'".to_string()
        }
    );
    let err = client
        .table("t")
        .update(&json!([{"nope": 1}]))
        .await
        .expect_err("bad column");
    assert!(err.to_string().contains("unknown column"), "{err}");
    assert_eq!(client.table("t").size().await.expect("size"), 3);
}

#[tokio::test]
async fn test_locked_server_is_read_only() {
    init_tracing();
    let server = server_with_table();
    server.lock();
    let (client, _conn) = connect(&server).await;
    let table = client.table("t");

    let err = table.clear().await.expect_err("locked");
    assert!(err.to_string().contains("locked"), "{err}");
    assert!(client
        .create_table("new", &json!({"a": [1]}), TableOptions::default())
        .await
        .is_err());

    let view = table.view("reader", ViewConfig::default()).await.expect("views still work");
    assert_eq!(view.num_rows().await.expect("rows"), 3);

    server.unlock();
    table.clear().await.expect("unlocked");
    assert_eq!(table.size().await.expect("size"), 0);
}

#[tokio::test]
async fn test_binary_update_and_remove() {
    init_tracing();
    let server = server_with_table();
    let (client, _conn) = connect(&server).await;
    let table = client.table("t");

    let payload = Bytes::from_static(br#"{"id":[4,5],"name":["d","e"]}"#);
    table.update_binary(payload, 0).await.expect("binary update");
    assert_eq!(table.size().await.expect("size"), 5);

    table.remove(vec![json!(1), json!(4)]).await.expect("remove");
    assert_eq!(table.size().await.expect("size"), 3);
    assert_eq!(table.get_index().await.expect("index"), Some("id".to_string()));
}

#[tokio::test]
async fn test_host_close_disconnects_the_client() {
    init_tracing();
    let server = server_with_table();
    let (client, conn) = connect(&server).await;
    client
        .table("t")
        .view("doomed", ViewConfig::default())
        .await
        .expect("view");

    // First session on a fresh server.
    assert!(server.close_session(ClientId::new(1)));
    conn.await.expect("join").expect("clean close");
    assert!(server.view("doomed").is_none());

    eventually(|| client.is_closed()).await;
    let result = tokio::time::timeout(Duration::from_secs(2), client.table("t").size())
        .await
        .expect("resolved, not left hanging");
    assert!(matches!(result, Err(ClientError::Disconnected { .. })));
    assert_eq!(client.pending_count(), 0);
    assert!(server.table("t").is_some());
}
