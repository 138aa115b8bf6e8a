#![allow(dead_code)]

use std::ops::Deref;

use tokio::sync::{Mutex, MutexGuard};

use etcdsql::kv::SqlBackend;
use etcdsql::models::EtcdError;

// Database tests share one schema; serialize them.
static DB_LOCK: Mutex<()> = Mutex::const_new(());

pub struct TestStore {
    store: SqlBackend,
    _guard: MutexGuard<'static, ()>,
}

impl Deref for TestStore {
    type Target = SqlBackend;

    fn deref(&self) -> &SqlBackend {
        &self.store
    }
}

/// Connects to the database named by `ETCDSQL_TEST_URL` and recreates
/// the schema. These tests are `#[ignore]`d by default; point
/// `ETCDSQL_TEST_URL` at a disposable postgres:// or mysql:// database
/// and run with `cargo test -- --ignored` to exercise them.
pub async fn test_store() -> TestStore {
    let guard = DB_LOCK.lock().await;
    let url = std::env::var("ETCDSQL_TEST_URL")
        .expect("ETCDSQL_TEST_URL must be set for database tests");
    let driver = if url.starts_with("mysql") || url.starts_with("mariadb") {
        "mysql"
    } else {
        "postgres"
    };
    let store = SqlBackend::connect(driver, &url)
        .await
        .expect("connect to test database");
    store.drop_schema().await.expect("drop schema");
    store.create_schema().await.expect("create schema");
    TestStore {
        store,
        _guard: guard,
    }
}

pub fn expect_error(err: &EtcdError, message: &str, cause: &str) {
    assert_eq!(err.message, message, "unexpected message in {:?}", err);
    assert_eq!(err.cause, cause, "unexpected cause in {:?}", err);
}
