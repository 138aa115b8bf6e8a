use sqlx::Row;

use crate::kv::query::Query;
use crate::kv::SqlBackend;
use crate::models::EtcdError;

impl SqlBackend {
    /// Purges expired nodes. Each expiration is a first-class mutation:
    /// it consumes its own index and appends an `expire` change row, so
    /// watchers see TTL deletions individually and in expiration order.
    ///
    /// Runs in its own transaction, before every write and at the start
    /// of every watcher refresh. When nothing has expired the reserved
    /// index is rolled back, so idle sweeps leave the counter untouched.
    pub async fn expire_nodes(&self) -> Result<(), EtcdError> {
        let mut tx = self.pool.begin().await?;
        let reserved = self.dialect.increment_index(&mut tx).await?;

        let mut q = Query::new(self.dialect);
        q.text(r#"SELECT "key", "modified" FROM "nodes" WHERE "deleted" = 0 AND "expiration" IS NOT NULL AND "expiration" < "#)
            .text(self.dialect.now())
            .text(r#" ORDER BY "expiration""#);
        let rows = q.fetch_all(&mut *tx).await?;

        let mut expiring = Vec::with_capacity(rows.len());
        for row in &rows {
            let key: String = row.try_get("key")?;
            let modified: i64 = row.try_get("modified")?;
            expiring.push((key, modified));
        }

        let mut next = reserved;
        for (key, modified) in &expiring {
            // the node row itself first; zero rows means an expired
            // ancestor already tombstoned this subtree in this pass
            let mut q = Query::new(self.dialect);
            q.text(r#"UPDATE "nodes" SET "deleted" = "#)
                .param(next)
                .text(r#" WHERE "key" = "#)
                .param(key.as_str())
                .text(r#" AND "deleted" = 0"#);
            if q.execute(&mut *tx).await?.rows_affected() == 0 {
                continue;
            }

            let mut q = Query::new(self.dialect);
            q.text(r#"UPDATE "nodes" SET "deleted" = "#)
                .param(next)
                .text(r#" WHERE "deleted" = 0 AND "key" LIKE "#)
                .param(format!("{}/%", key));
            q.execute(&mut *tx).await?;

            self.record_change(&mut tx, next, key, "expire", Some(*modified))
                .await?;
            next += 1;
        }

        if next == reserved {
            tx.rollback().await?;
            return Ok(());
        }

        // reserved was already consumed by the first expiration; move the
        // counter up to the last index handed out
        if next - 1 > reserved {
            let mut q = Query::new(self.dialect);
            q.text(r#"UPDATE "index" SET "index" = "#).param(next - 1);
            q.execute(&mut *tx).await?;
        }

        tracing::debug!(count = next - reserved, "expired nodes");
        tx.commit().await?;
        Ok(())
    }
}
