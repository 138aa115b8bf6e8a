mod common;

use std::time::Duration;

use etcdsql::kv::Condition;

use common::{expect_error, test_store};

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn get_missing_returns_not_found() {
    let store = test_store().await;

    let err = store.get("/foo", false, false).await.unwrap_err();
    expect_error(&err, "Key not found", "/foo");
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn set_then_get() {
    let store = test_store().await;

    let (node, prev) = store.set("/foo", "bar", &Condition::Always).await.unwrap();
    assert!(prev.is_none(), "fresh set should have no prevNode");
    assert_eq!(node.key, "/foo");
    assert_eq!(node.value, "bar");
    assert_eq!(node.created_index, 1);
    assert_eq!(node.modified_index, 1);

    let got = store.get("/foo", false, false).await.unwrap();
    assert_eq!(got.value, "bar");
    assert_eq!(got.modified_index, node.modified_index);
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn full_cycle() {
    let store = test_store().await;

    store.set("/foo", "bar", &Condition::Always).await.unwrap();

    let (prev, _index) = store.delete("/foo", &Condition::Always).await.unwrap();
    assert_eq!(prev.key, "/foo");
    assert_eq!(prev.value, "bar");

    let err = store.get("/foo", false, false).await.unwrap_err();
    expect_error(&err, "Key not found", "/foo");
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn set_prev_exist_true() {
    let store = test_store().await;

    store.set("/foo", "original", &Condition::Always).await.unwrap();

    let (node, prev) = store
        .set("/foo", "updated", &Condition::PrevExist(true))
        .await
        .unwrap();
    assert_eq!(node.value, "updated");
    assert_eq!(prev.unwrap().value, "original");

    let err = store
        .set("/missing", "updated", &Condition::PrevExist(true))
        .await
        .unwrap_err();
    expect_error(&err, "Key not found", "/missing");
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn set_prev_exist_false() {
    let store = test_store().await;

    let (node, prev) = store
        .set("/foo", "bar", &Condition::PrevExist(false))
        .await
        .unwrap();
    assert_eq!(node.value, "bar");
    assert!(prev.is_none());

    let err = store
        .set("/foo", "updated", &Condition::PrevExist(false))
        .await
        .unwrap_err();
    expect_error(&err, "Key already exists", "/foo");
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn set_prev_value() {
    let store = test_store().await;

    store.set("/foo", "original", &Condition::Always).await.unwrap();

    let (node, prev) = store
        .set("/foo", "updated", &Condition::PrevValue("original".to_string()))
        .await
        .unwrap();
    assert_eq!(node.value, "updated");
    assert_eq!(prev.unwrap().value, "original");
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn set_prev_value_mismatch_leaves_store_unchanged() {
    let store = test_store().await;

    store.set("/k", "v1", &Condition::Always).await.unwrap();

    let err = store
        .set("/k", "v2", &Condition::PrevValue("wrong".to_string()))
        .await
        .unwrap_err();
    expect_error(&err, "Compare failed", "[wrong != v1]");
    assert_eq!(err.index, 1, "error carries the pre-mutation index");

    // the failed transaction consumed no index and wrote nothing
    assert_eq!(store.get("/k", false, false).await.unwrap().value, "v1");
    assert_eq!(store.current_index().await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn set_prev_value_missing() {
    let store = test_store().await;

    let err = store
        .set("/foo", "updated", &Condition::PrevValue("does not exist".to_string()))
        .await
        .unwrap_err();
    expect_error(&err, "Key not found", "/foo");
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn set_prev_index() {
    let store = test_store().await;

    let (node, _) = store.set("/foo", "original", &Condition::Always).await.unwrap();

    let (node, prev) = store
        .set("/foo", "updated", &Condition::PrevIndex(node.modified_index))
        .await
        .unwrap();
    assert_eq!(node.value, "updated");
    assert_eq!(prev.unwrap().value, "original");

    let err = store
        .set("/foo", "again", &Condition::PrevIndex(100))
        .await
        .unwrap_err();
    expect_error(&err, "Compare failed", "[100 != 2]");
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn delete_prev_value() {
    let store = test_store().await;

    store.set("/foo", "original", &Condition::Always).await.unwrap();
    let (prev, _) = store
        .delete("/foo", &Condition::PrevValue("original".to_string()))
        .await
        .unwrap();
    assert_eq!(prev.value, "original");

    store.set("/foo", "original", &Condition::Always).await.unwrap();
    let err = store
        .delete("/foo", &Condition::PrevValue("different value".to_string()))
        .await
        .unwrap_err();
    expect_error(&err, "Compare failed", "[different value != original]");
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn delete_prev_index() {
    let store = test_store().await;

    let (node, _) = store.set("/foo", "original", &Condition::Always).await.unwrap();
    let (prev, _) = store
        .delete("/foo", &Condition::PrevIndex(node.modified_index))
        .await
        .unwrap();
    assert_eq!(prev.value, "original");

    store.set("/foo", "original", &Condition::Always).await.unwrap();
    let err = store
        .delete("/foo", &Condition::PrevIndex(100))
        .await
        .unwrap_err();
    expect_error(&err, "Compare failed", "[100 != 2]");
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn mkdir_simple() {
    let store = test_store().await;

    store.mk_dir("/foo", None, &Condition::Always).await.unwrap();

    let node = store.get("/foo", false, false).await.unwrap();
    assert!(node.dir);
    assert!(node.nodes.is_empty());
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn mkdir_replaces_file_but_not_dir() {
    let store = test_store().await;

    store.set("/foo", "original", &Condition::Always).await.unwrap();

    let (node, prev) = store.mk_dir("/foo", None, &Condition::Always).await.unwrap();
    assert!(node.dir);
    let prev = prev.unwrap();
    assert!(!prev.dir);
    assert_eq!(prev.value, "original");

    let err = store.mk_dir("/foo", None, &Condition::Always).await.unwrap_err();
    expect_error(&err, "Not a file", "/foo");

    let err = store
        .mk_dir("/foo", None, &Condition::PrevExist(false))
        .await
        .unwrap_err();
    expect_error(&err, "Key already exists", "/foo");
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn get_lists_directory() {
    let store = test_store().await;

    store.mk_dir("/foo", None, &Condition::Always).await.unwrap();
    store.mk_dir("/foo/bar", None, &Condition::Always).await.unwrap();
    store.set("/foo/bar/baz", "value", &Condition::Always).await.unwrap();

    // non-recursive stops at immediate children
    let node = store.get("/foo", false, false).await.unwrap();
    assert!(node.dir);
    assert_eq!(node.nodes.len(), 1);
    assert_eq!(node.nodes[0].key, "/foo/bar");
    assert!(node.nodes[0].nodes.is_empty());

    // recursive returns the whole subtree
    let node = store.get("/foo", true, false).await.unwrap();
    assert_eq!(node.nodes.len(), 1);
    let child = &node.nodes[0];
    assert_eq!(child.key, "/foo/bar");
    assert_eq!(child.nodes.len(), 1);
    let grandchild = &child.nodes[0];
    assert_eq!(grandchild.key, "/foo/bar/baz");
    assert_eq!(grandchild.value, "value");
    assert!(!grandchild.dir);
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn set_creates_parent_directories() {
    let store = test_store().await;

    store.set("/a/b/c", "x", &Condition::Always).await.unwrap();

    let node = store.get("/a", true, false).await.unwrap();
    assert!(node.dir);
    assert_eq!(node.nodes.len(), 1);
    let child = &node.nodes[0];
    assert_eq!(child.key, "/a/b");
    assert!(child.dir);
    let grandchild = &child.nodes[0];
    assert_eq!(grandchild.key, "/a/b/c");
    assert_eq!(grandchild.value, "x");

    // parents share the child's mutation index
    assert_eq!(grandchild.created_index, node.created_index);
    assert_eq!(grandchild.modified_index, node.modified_index);
    assert_eq!(grandchild.created_index, 1);
    assert_eq!(store.current_index().await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn set_does_not_overwrite_parent_file() {
    let store = test_store().await;

    store.set("/foo", "value", &Condition::Always).await.unwrap();

    let err = store.set("/foo/bar", "value", &Condition::Always).await.unwrap_err();
    expect_error(&err, "Not a directory", "/foo");

    let err = store.mk_dir("/foo/bar", None, &Condition::Always).await.unwrap_err();
    expect_error(&err, "Not a directory", "/foo");
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn delete_does_not_remove_directory() {
    let store = test_store().await;

    store.mk_dir("/foo", None, &Condition::Always).await.unwrap();

    let err = store.delete("/foo", &Condition::Always).await.unwrap_err();
    expect_error(&err, "Not a file", "/foo");
}

// dir=true can also delete files, matching etcd
#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn rmdir_can_remove_file() {
    let store = test_store().await;

    store.set("/foo", "value", &Condition::Always).await.unwrap();
    store.rm_dir("/foo", false, &Condition::Always).await.unwrap();

    let err = store.get("/foo", false, false).await.unwrap_err();
    expect_error(&err, "Key not found", "/foo");
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn rmdir_refuses_non_empty_unless_recursive() {
    let store = test_store().await;

    store.mk_dir("/d", None, &Condition::Always).await.unwrap();
    store.set("/d/x", "1", &Condition::Always).await.unwrap();

    let err = store.rm_dir("/d", false, &Condition::Always).await.unwrap_err();
    expect_error(&err, "Directory not empty", "/d");

    // the failed attempt rolled back; both nodes still live
    store.get("/d/x", false, false).await.unwrap();

    let (_, index) = store.rm_dir("/d", true, &Condition::Always).await.unwrap();
    let err = store.get("/d", false, false).await.unwrap_err();
    expect_error(&err, "Key not found", "/d");
    let err = store.get("/d/x", false, false).await.unwrap_err();
    expect_error(&err, "Key not found", "/d/x");

    // the whole subtree went away at one index
    assert_eq!(store.current_index().await.unwrap(), index);
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn rmdir_removes_empty_directory() {
    let store = test_store().await;

    store.mk_dir("/foo", None, &Condition::Always).await.unwrap();
    store.rm_dir("/foo", false, &Condition::Always).await.unwrap();

    let err = store.get("/foo", false, false).await.unwrap_err();
    expect_error(&err, "Key not found", "/foo");
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn root_is_read_only() {
    let store = test_store().await;

    let err = store.set("/", "x", &Condition::Always).await.unwrap_err();
    expect_error(&err, "Root is read only", "/");

    let err = store.delete("/", &Condition::Always).await.unwrap_err();
    expect_error(&err, "Root is read only", "/");

    let err = store.rm_dir("/", true, &Condition::Always).await.unwrap_err();
    expect_error(&err, "Root is read only", "/");
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn get_root_synthesizes_directory() {
    let store = test_store().await;

    store.set("/a", "1", &Condition::Always).await.unwrap();
    store.set("/b/c", "2", &Condition::Always).await.unwrap();

    let root = store.get("/", false, true).await.unwrap();
    assert!(root.dir);
    let keys: Vec<&str> = root.nodes.iter().map(|n| n.key.as_str()).collect();
    assert_eq!(keys, vec!["/a", "/b"]);
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn ttl_sets_expiration() {
    let store = test_store().await;

    store.set_ttl("/foo", "value", 100, &Condition::Always).await.unwrap();

    let node = store.get("/foo", false, false).await.unwrap();
    let ttl = node.ttl.expect("ttl should be set");
    assert!((90..=100).contains(&ttl), "unexpected ttl: {}", ttl);
    assert!(node.expiration.is_some());
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn ttl_cleared_by_plain_set() {
    let store = test_store().await;

    store.set_ttl("/foo", "value", 100, &Condition::Always).await.unwrap();
    store.set("/foo", "value", &Condition::Always).await.unwrap();

    let node = store.get("/foo", false, false).await.unwrap();
    assert!(node.ttl.is_none());
    assert!(node.expiration.is_none());
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn ttl_counts_down() {
    let store = test_store().await;

    store.set_ttl("/foo", "value", 100, &Condition::Always).await.unwrap();

    // MySQL stores timestamps at 1-second precision; sleep past it
    tokio::time::sleep(Duration::from_secs(2)).await;

    let node = store.get("/foo", false, false).await.unwrap();
    assert!(node.ttl.expect("ttl") < 100);
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn ttl_node_expires() {
    let store = test_store().await;

    store.set_ttl("/k", "v", 1, &Condition::Always).await.unwrap();
    assert_eq!(store.current_index().await.unwrap(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;

    let err = store.get("/k", false, false).await.unwrap_err();
    expect_error(&err, "Key not found", "/k");

    // the sweep turns the expiration into a first-class mutation
    store.expire_nodes().await.unwrap();
    assert_eq!(store.current_index().await.unwrap(), 2);

    // sweeping again consumes nothing
    store.expire_nodes().await.unwrap();
    assert_eq!(store.current_index().await.unwrap(), 2);
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn create_in_order() {
    let store = test_store().await;

    let node1 = store.create_in_order("/q", "a", None).await.unwrap();
    let node2 = store.create_in_order("/q", "b", None).await.unwrap();

    assert!(node2.created_index > node1.created_index);
    assert_eq!(node1.key, format!("/q/{}", node1.created_index));
    assert_eq!(node2.key, format!("/q/{}", node2.created_index));

    let dir = store.get("/q", false, true).await.unwrap();
    assert!(dir.dir);
    assert_eq!(dir.nodes.len(), 2);
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn create_in_order_with_ttl() {
    let store = test_store().await;

    let node = store.create_in_order("/q", "value", Some(100)).await.unwrap();
    assert!(node.ttl.is_some());
    assert!(node.expiration.is_some());
}

#[tokio::test]
#[ignore = "needs a database (set ETCDSQL_TEST_URL)"]
async fn concurrent_sets_both_apply() {
    let store = test_store().await;

    let (a, b) = tokio::join!(
        store.set("/k", "a", &Condition::Always),
        store.set("/k", "b", &Condition::Always),
    );
    let (a, _) = a.unwrap();
    let (b, _) = b.unwrap();
    assert_ne!(a.modified_index, b.modified_index);

    // the surviving value belongs to the later mutation
    let node = store.get("/k", false, false).await.unwrap();
    let winner = if a.modified_index > b.modified_index { &a } else { &b };
    assert_eq!(node.value, winner.value);
    assert_eq!(node.modified_index, winner.modified_index);
}
