// The storage engine: a filesystem-shaped key tree simulated on flat
// rows, with soft-deleted history retained for the change log.

pub mod condition;
pub mod dialect;
pub mod expire;
pub mod query;
pub mod watch;

pub use condition::Condition;
pub use dialect::Dialect;

use std::collections::HashMap;

use anyhow::{bail, Context};
use chrono::DateTime;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Connection, Row, Transaction};

use crate::kv::query::Query;
use crate::models::{EtcdError, Node};

/// Retention window: how many change rows (and the tombstones they
/// reference) survive pruning. Also the capacity of the watcher's ring.
pub const MAX_CHANGES: i64 = 1000;

/// The SQL-backed node store. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct SqlBackend {
    pool: AnyPool,
    dialect: Dialect,
}

impl SqlBackend {
    /// Connects a pool for the given driver. MySQL sessions get
    /// ANSI_QUOTES switched on so both engines accept the same quoting.
    pub async fn connect(driver: &str, datasource: &str) -> anyhow::Result<SqlBackend> {
        let Some(dialect) = Dialect::from_driver(driver) else {
            bail!("unsupported driver: {}", driver);
        };
        if !dialect.matches_datasource(datasource) {
            bail!("datasource URL does not select the {} driver", driver);
        }
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(10)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if let Some(setup) = dialect.session_setup() {
                        sqlx::query(setup).execute(&mut *conn).await?;
                    }
                    Ok(())
                })
            })
            .connect(datasource)
            .await
            .with_context(|| format!("failed to connect to {} database", driver))?;
        Ok(SqlBackend { pool, dialect })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub async fn create_schema(&self) -> anyhow::Result<()> {
        for statement in self.dialect.table_definitions() {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("schema statement failed: {}", statement))?;
        }
        Ok(())
    }

    pub async fn drop_schema(&self) -> anyhow::Result<()> {
        for statement in self.dialect.drop_statements() {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("drop statement failed: {}", statement))?;
        }
        Ok(())
    }

    /// The current value of the global index counter.
    pub async fn current_index(&self) -> Result<i64, EtcdError> {
        let row = sqlx::query(r#"SELECT "index" FROM "index""#)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get(0)?)
    }

    /// Returns the node at `key`, with immediate children for a directory
    /// and the whole subtree when `recursive`. Root is synthesized.
    pub async fn get(&self, key: &str, recursive: bool, sorted: bool) -> Result<Node, EtcdError> {
        let mut q = self.select_node();
        if key == "/" {
            q.text(" WHERE ");
            self.push_live(&mut q);
            if !recursive {
                q.text(r#" AND "path_depth" = 1"#);
            }
        } else {
            q.text(r#" WHERE ("key" = "#)
                .param(key)
                .text(r#" OR ("key" LIKE "#)
                .param(format!("{}/%", key));
            if !recursive {
                q.text(r#" AND "path_depth" = "#).param(path_depth(key) + 1);
            }
            q.text(")) AND ");
            self.push_live(&mut q);
        }

        let rows = q.fetch_all(&self.pool).await?;
        let mut nodes = Vec::with_capacity(rows.len());
        for row in &rows {
            nodes.push(scan_node(row)?);
        }

        match assemble_tree(key, nodes, sorted) {
            Some(node) => Ok(node),
            None => Err(EtcdError::not_found(key, self.current_index().await?)),
        }
    }

    /// Sets the value for a key.
    pub async fn set(
        &self,
        key: &str,
        value: &str,
        condition: &Condition,
    ) -> Result<(Node, Option<Node>), EtcdError> {
        self.set_node(key, value, false, None, condition).await
    }

    /// Sets a value that expires `ttl` seconds from now.
    pub async fn set_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: i64,
        condition: &Condition,
    ) -> Result<(Node, Option<Node>), EtcdError> {
        self.set_node(key, value, false, Some(ttl), condition).await
    }

    /// Creates a directory at `key`, optionally with a TTL.
    pub async fn mk_dir(
        &self,
        key: &str,
        ttl: Option<i64>,
        condition: &Condition,
    ) -> Result<(Node, Option<Node>), EtcdError> {
        self.set_node(key, "", true, ttl, condition).await
    }

    async fn set_node(
        &self,
        key: &str,
        value: &str,
        dir: bool,
        ttl: Option<i64>,
        condition: &Condition,
    ) -> Result<(Node, Option<Node>), EtcdError> {
        if key == "/" {
            return Err(EtcdError::root_read_only(self.current_index().await?));
        }
        self.expire_nodes().await?;

        let mut tx = self.pool.begin().await?;
        let index = self.dialect.increment_index(&mut tx).await?;

        let prev = self.get_one(&mut tx, key).await?;
        condition.check(key, index - 1, prev.as_ref())?;
        if let Some(prev) = &prev {
            if prev.dir {
                return Err(EtcdError::not_a_file(key, index - 1));
            }
        }

        self.mkdirs(&mut tx, parent_key(key), index).await?;

        if prev.is_some() {
            let mut q = Query::new(self.dialect);
            q.text(r#"UPDATE "nodes" SET "deleted" = "#)
                .param(index)
                .text(r#" WHERE "key" = "#)
                .param(key)
                .text(r#" AND "deleted" = 0"#);
            q.execute(&mut *tx).await?;
        }

        // createdIndex survives an overwrite of the same node type
        let created = match &prev {
            Some(prev) if prev.dir == dir => prev.created_index,
            _ => index,
        };
        self.insert_node(&mut tx, key, value, dir, created, index, ttl)
            .await?;

        let action = condition.set_action_name();
        self.record_change(&mut tx, index, key, action, prev.as_ref().map(|p| p.modified_index))
            .await?;
        self.prune(&mut tx, index).await?;

        let node = self
            .get_one(&mut tx, key)
            .await?
            .ok_or_else(|| EtcdError::internal(format!("node {} missing after write", key)))?;
        tx.commit().await?;
        Ok((node, prev))
    }

    /// Appends a node under `key`, named by the mutation's own index so
    /// concurrent creates order themselves.
    pub async fn create_in_order(
        &self,
        key: &str,
        value: &str,
        ttl: Option<i64>,
    ) -> Result<Node, EtcdError> {
        self.expire_nodes().await?;

        let mut tx = self.pool.begin().await?;
        let index = self.dialect.increment_index(&mut tx).await?;

        let child_key = if key == "/" {
            format!("/{}", index)
        } else {
            format!("{}/{}", key, index)
        };

        self.mkdirs(&mut tx, key, index).await?;
        self.insert_node(&mut tx, &child_key, value, false, index, index, ttl)
            .await?;
        self.record_change(&mut tx, index, &child_key, "create", None)
            .await?;
        self.prune(&mut tx, index).await?;

        let node = self
            .get_one(&mut tx, &child_key)
            .await?
            .ok_or_else(|| EtcdError::internal(format!("node {} missing after write", child_key)))?;
        tx.commit().await?;
        Ok(node)
    }

    /// Removes a leaf. Returns the removed node and the deletion index.
    pub async fn delete(&self, key: &str, condition: &Condition) -> Result<(Node, i64), EtcdError> {
        if key == "/" {
            return Err(EtcdError::root_read_only(self.current_index().await?));
        }
        self.expire_nodes().await?;

        let mut tx = self.pool.begin().await?;
        let index = self.dialect.increment_index(&mut tx).await?;

        let node = match self.get_one(&mut tx, key).await? {
            Some(node) => node,
            None => return Err(EtcdError::not_found(key, index - 1)),
        };
        if node.dir {
            return Err(EtcdError::not_a_file(key, index - 1));
        }
        condition.check(key, index - 1, Some(&node))?;

        let mut q = Query::new(self.dialect);
        q.text(r#"UPDATE "nodes" SET "deleted" = "#)
            .param(index)
            .text(r#" WHERE "key" = "#)
            .param(key)
            .text(r#" AND "deleted" = 0"#);
        q.execute(&mut *tx).await?;

        let action = condition.delete_action_name();
        self.record_change(&mut tx, index, key, action, Some(node.modified_index))
            .await?;
        self.prune(&mut tx, index).await?;
        tx.commit().await?;
        Ok((node, index))
    }

    /// Removes a directory, or a leaf (etcd accepts `dir=true` deletes on
    /// files). The whole subtree is tombstoned with a single index; a
    /// non-recursive removal that would touch more than the node itself
    /// rolls back.
    pub async fn rm_dir(
        &self,
        key: &str,
        recursive: bool,
        condition: &Condition,
    ) -> Result<(Node, i64), EtcdError> {
        if key == "/" {
            return Err(EtcdError::root_read_only(self.current_index().await?));
        }
        self.expire_nodes().await?;

        let mut tx = self.pool.begin().await?;
        let index = self.dialect.increment_index(&mut tx).await?;

        let node = match self.get_one(&mut tx, key).await? {
            Some(node) => node,
            None => return Err(EtcdError::not_found(key, index - 1)),
        };
        condition.check(key, index - 1, Some(&node))?;

        let mut q = Query::new(self.dialect);
        q.text(r#"UPDATE "nodes" SET "deleted" = "#)
            .param(index)
            .text(r#" WHERE "deleted" = 0 AND ("key" = "#)
            .param(key)
            .text(r#" OR "key" LIKE "#)
            .param(format!("{}/%", key))
            .text(")");
        let affected = q.execute(&mut *tx).await?.rows_affected();
        if !recursive && affected > 1 {
            return Err(EtcdError::directory_not_empty(key, index - 1));
        }

        let action = condition.delete_action_name();
        self.record_change(&mut tx, index, key, action, Some(node.modified_index))
            .await?;
        self.prune(&mut tx, index).await?;
        tx.commit().await?;
        Ok((node, index))
    }

    /// Creates any missing parent directories for a write at `index`,
    /// climbing from the immediate parent. Each insert runs under a
    /// savepoint so a duplicate-key conflict can be unwound without
    /// poisoning the outer transaction.
    async fn mkdirs(
        &self,
        tx: &mut Transaction<'_, Any>,
        path: &str,
        index: i64,
    ) -> Result<(), EtcdError> {
        let mut path = path;
        while path != "/" && !path.is_empty() {
            let mut sp = (&mut **tx).begin().await?;
            let mut q = Query::new(self.dialect);
            q.text(r#"INSERT INTO "nodes" ("key", "value", "dir", "created", "modified", "path_depth") VALUES ("#)
                .param(path)
                .text(", ")
                .param("")
                .text(", ")
                .param(true)
                .text(", ")
                .param(index)
                .text(", ")
                .param(index)
                .text(", ")
                .param(path_depth(path))
                .text(")");
            match q.execute(&mut *sp).await {
                Ok(_) => sp.commit().await?,
                Err(err) if self.dialect.is_duplicate_key(&err) => {
                    sp.rollback().await?;
                    // an entry already exists: a directory means every
                    // further ancestor exists too, a leaf is fatal
                    let mut q = Query::new(self.dialect);
                    q.text(r#"SELECT CASE WHEN "dir" THEN 1 ELSE 0 END FROM "nodes" WHERE "key" = "#)
                        .param(path)
                        .text(r#" AND "deleted" = 0"#);
                    let row = q.fetch_one(&mut **tx).await?;
                    let dir: i64 = row.try_get(0)?;
                    if dir == 0 {
                        return Err(EtcdError::not_a_directory(path, index - 1));
                    }
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
            path = parent_key(path);
        }
        Ok(())
    }

    async fn insert_node(
        &self,
        tx: &mut Transaction<'_, Any>,
        key: &str,
        value: &str,
        dir: bool,
        created: i64,
        modified: i64,
        ttl: Option<i64>,
    ) -> Result<(), EtcdError> {
        let mut q = Query::new(self.dialect);
        q.text(r#"INSERT INTO "nodes" ("key", "value", "dir", "created", "modified", "path_depth", "expiration") VALUES ("#)
            .param(key)
            .text(", ")
            .param(value)
            .text(", ")
            .param(dir)
            .text(", ")
            .param(created)
            .text(", ")
            .param(modified)
            .text(", ")
            .param(path_depth(key))
            .text(", ");
        match ttl {
            Some(ttl) => self.dialect.expiration(&mut q, ttl),
            None => {
                q.text("NULL");
            }
        }
        q.text(")");
        q.execute(&mut **tx).await?;
        Ok(())
    }

    pub(crate) async fn record_change(
        &self,
        tx: &mut Transaction<'_, Any>,
        index: i64,
        key: &str,
        action: &str,
        prev_node_modified: Option<i64>,
    ) -> sqlx::Result<()> {
        let mut q = Query::new(self.dialect);
        q.text(r#"INSERT INTO "changes" ("index", "key", "action", "prev_node_modified") VALUES ("#)
            .param(index)
            .text(", ")
            .param(key)
            .text(", ")
            .param(action)
            .text(", ")
            .param(prev_node_modified)
            .text(")");
        q.execute(&mut **tx).await?;
        Ok(())
    }

    /// Drops change rows that fell out of the retention window, and the
    /// tombstones nothing references anymore.
    async fn prune(&self, tx: &mut Transaction<'_, Any>, index: i64) -> sqlx::Result<()> {
        let horizon = index - MAX_CHANGES;
        if horizon <= 0 {
            return Ok(());
        }
        let mut q = Query::new(self.dialect);
        q.text(r#"DELETE FROM "changes" WHERE "index" <= "#).param(horizon);
        q.execute(&mut **tx).await?;

        let mut q = Query::new(self.dialect);
        q.text(r#"DELETE FROM "nodes" WHERE "deleted" <> 0 AND "deleted" <= "#)
            .param(horizon);
        q.execute(&mut **tx).await?;
        Ok(())
    }

    /// Change rows after `last_index`, oldest first.
    pub(crate) async fn changes_since(
        &self,
        last_index: i64,
    ) -> sqlx::Result<Vec<(i64, String, String, Option<i64>)>> {
        let mut q = Query::new(self.dialect);
        q.text(r#"SELECT "index", "key", "action", "prev_node_modified" FROM "changes" WHERE "index" > "#)
            .param(last_index)
            .text(r#" ORDER BY "index""#);
        let rows = q.fetch_all(&self.pool).await?;
        let mut changes = Vec::with_capacity(rows.len());
        for row in rows {
            changes.push((
                row.try_get("index")?,
                row.try_get("key")?,
                row.try_get("action")?,
                row.try_get("prev_node_modified")?,
            ));
        }
        Ok(changes)
    }

    /// Rows for `key` at the given modification indices, tombstones
    /// included. Used to materialize change records.
    pub(crate) async fn nodes_by_modified(
        &self,
        key: &str,
        modified: &[i64],
    ) -> sqlx::Result<Vec<Node>> {
        let mut q = self.select_node();
        q.text(r#" WHERE "key" = "#)
            .param(key)
            .text(r#" AND "modified" IN ("#);
        for (i, index) in modified.iter().enumerate() {
            if i > 0 {
                q.text(", ");
            }
            q.param(*index);
        }
        q.text(")");
        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(scan_node).collect()
    }

    async fn get_one(
        &self,
        tx: &mut Transaction<'_, Any>,
        key: &str,
    ) -> sqlx::Result<Option<Node>> {
        let mut q = self.select_node();
        q.text(r#" WHERE "key" = "#).param(key).text(" AND ");
        self.push_live(&mut q);
        let row = q.fetch_optional(&mut **tx).await?;
        row.as_ref().map(scan_node).transpose()
    }

    /// The node column list. `dir` is normalized to an integer and the
    /// timestamp column never leaves SQL: the remaining TTL and the
    /// expiration epoch come back as plain integers.
    fn select_node(&self) -> Query {
        let mut q = Query::new(self.dialect);
        q.text(r#"SELECT "key", "value", CASE WHEN "dir" THEN 1 ELSE 0 END AS "dir", "created", "modified", "#)
            .text(self.dialect.ttl())
            .text(r#" AS "ttl", "#)
            .text(self.dialect.expiration_epoch())
            .text(r#" AS "expiration_epoch" FROM "nodes""#);
        q
    }

    /// Restricts a query to the live tree: not tombstoned and not past
    /// its expiration (the sweeper may lag by up to a refresh tick).
    fn push_live(&self, q: &mut Query) {
        q.text(r#"("deleted" = 0 AND ("expiration" IS NULL OR "expiration" > "#)
            .text(self.dialect.now())
            .text("))");
    }
}

fn scan_node(row: &AnyRow) -> sqlx::Result<Node> {
    let dir: i64 = row.try_get("dir")?;
    let expiration_epoch: Option<i64> = row.try_get("expiration_epoch")?;
    Ok(Node {
        key: row.try_get("key")?,
        value: row.try_get("value")?,
        created_index: row.try_get("created")?,
        modified_index: row.try_get("modified")?,
        dir: dir != 0,
        ttl: row.try_get("ttl")?,
        expiration: expiration_epoch.and_then(|secs| DateTime::from_timestamp(secs, 0)),
        nodes: Vec::new(),
    })
}

/// Links a flat row set into the tree rooted at `key`. Returns None when
/// the requested node itself is missing; the root is always synthesized.
fn assemble_tree(key: &str, nodes: Vec<Node>, sorted: bool) -> Option<Node> {
    let mut children: HashMap<String, Vec<Node>> = HashMap::new();
    let mut requested: Option<Node> = None;
    for node in nodes {
        if node.key == key {
            requested = Some(node);
        } else {
            children
                .entry(parent_key(&node.key).to_string())
                .or_default()
                .push(node);
        }
    }

    let mut root = if key == "/" {
        Node {
            key: "/".to_string(),
            dir: true,
            ..Default::default()
        }
    } else {
        requested?
    };
    attach_children(&mut root, &mut children, sorted);
    Some(root)
}

fn attach_children(node: &mut Node, children: &mut HashMap<String, Vec<Node>>, sorted: bool) {
    if let Some(mut kids) = children.remove(&node.key) {
        if sorted {
            kids.sort_by(|a, b| a.key.cmp(&b.key));
        }
        node.nodes = kids;
        for child in &mut node.nodes {
            attach_children(child, children, sorted);
        }
    }
}

/// The parent path of a key; the parent of a top-level key is `/`.
pub(crate) fn parent_key(key: &str) -> &str {
    match key.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &key[..i],
    }
}

/// Number of `/` separators in the key; immediate children of `key` sit
/// at `path_depth(key) + 1`.
pub(crate) fn path_depth(key: &str) -> i64 {
    key.matches('/').count() as i64
}
