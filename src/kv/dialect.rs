use sqlx::AnyConnection;
use sqlx::Row;

use crate::kv::query::Query;

/// The SQL flavor behind the pool. Everything the two engines disagree on
/// lives here: identifier quoting is handled by forcing ANSI_QUOTES on
/// MySQL sessions, the rest by the methods below.
///
/// Timestamps never cross the driver boundary: TTL arithmetic happens in
/// SQL and comes back as plain integers, so both engines look the same to
/// the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
}

impl Dialect {
    /// Resolves the positional driver argument.
    pub fn from_driver(driver: &str) -> Option<Dialect> {
        match driver {
            "postgres" => Some(Dialect::Postgres),
            "mysql" => Some(Dialect::MySql),
            _ => None,
        }
    }

    /// Checks that the datasource URL actually selects this dialect's
    /// driver, so a `mysql` positional argument with a postgres URL fails
    /// up front instead of at the first query.
    pub fn matches_datasource(&self, datasource: &str) -> bool {
        match self {
            Dialect::Postgres => {
                datasource.starts_with("postgres://") || datasource.starts_with("postgresql://")
            }
            Dialect::MySql => {
                datasource.starts_with("mysql://") || datasource.starts_with("mariadb://")
            }
        }
    }

    /// Statement to run on every fresh connection, if any. MySQL needs
    /// ANSI_QUOTES so that double-quoted identifiers escape reserved words
    /// the same way they do on Postgres.
    pub fn session_setup(&self) -> Option<&'static str> {
        match self {
            Dialect::Postgres => None,
            Dialect::MySql => {
                Some("SET SESSION sql_mode = CONCAT(@@SESSION.sql_mode, ',ANSI_QUOTES')")
            }
        }
    }

    pub fn table_definitions(&self) -> Vec<&'static str> {
        match self {
            Dialect::MySql => vec![
                r#"CREATE TABLE "nodes" (
                    "key" varchar(255),
                    "created" bigint NOT NULL,
                    "modified" bigint NOT NULL,
                    "deleted" bigint NOT NULL DEFAULT 0,
                    "value" text NOT NULL,
                    "expiration" timestamp NULL,
                    "dir" boolean NOT NULL DEFAULT 0,
                    "path_depth" integer,
                    PRIMARY KEY ("key", "deleted")
                ) ENGINE=InnoDB DEFAULT CHARSET=utf8"#,
                r#"CREATE INDEX "nodes_expiration" ON "nodes" ("expiration")"#,
                r#"CREATE TABLE "index" (
                    "index" bigint,
                    PRIMARY KEY ("index")
                ) ENGINE=InnoDB"#,
                r#"CREATE TABLE "changes" (
                    "index" bigint,
                    "key" varchar(255) NOT NULL,
                    "action" varchar(32) NOT NULL,
                    "prev_node_modified" bigint,
                    PRIMARY KEY ("index", "key")
                ) ENGINE=InnoDB"#,
                r#"INSERT INTO "index" ("index") VALUES (0)"#,
            ],
            Dialect::Postgres => vec![
                r#"CREATE TABLE "nodes" (
                    "key" varchar(2048),
                    "created" bigint NOT NULL,
                    "modified" bigint NOT NULL,
                    "deleted" bigint NOT NULL DEFAULT 0,
                    "value" text NOT NULL DEFAULT '',
                    "expiration" timestamp,
                    "dir" boolean NOT NULL DEFAULT 'false',
                    "path_depth" integer,
                    PRIMARY KEY ("key", "deleted")
                )"#,
                r#"CREATE INDEX ON "nodes" ("expiration")"#,
                r#"CREATE TABLE "index" (
                    "index" bigint,
                    PRIMARY KEY ("index")
                )"#,
                r#"CREATE TABLE "changes" (
                    "index" bigint,
                    "key" varchar(2048) NOT NULL,
                    "action" varchar(32) NOT NULL,
                    "prev_node_modified" bigint,
                    PRIMARY KEY ("index", "key")
                )"#,
                r#"INSERT INTO "index" ("index") VALUES (0)"#,
            ],
        }
    }

    pub fn drop_statements(&self) -> Vec<&'static str> {
        vec![
            r#"DROP TABLE IF EXISTS "nodes""#,
            r#"DROP TABLE IF EXISTS "index""#,
            r#"DROP TABLE IF EXISTS "changes""#,
        ]
    }

    /// Renders the placeholder for the `n`th parameter (1-based).
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", n),
            Dialect::MySql => "?".to_string(),
        }
    }

    /// Advances the single-row index counter and returns the new value.
    /// Postgres can do it in one statement; MySQL needs a read-back.
    pub async fn increment_index(&self, conn: &mut AnyConnection) -> sqlx::Result<i64> {
        match self {
            Dialect::Postgres => {
                let row =
                    sqlx::query(r#"UPDATE "index" SET "index" = "index" + 1 RETURNING "index""#)
                        .fetch_one(&mut *conn)
                        .await?;
                row.try_get(0)
            }
            Dialect::MySql => {
                sqlx::query(r#"UPDATE "index" SET "index" = "index" + 1"#)
                    .execute(&mut *conn)
                    .await?;
                let row = sqlx::query(r#"SELECT "index" FROM "index""#)
                    .fetch_one(&mut *conn)
                    .await?;
                row.try_get(0)
            }
        }
    }

    /// Appends the expression for "now plus `ttl` seconds" to a query.
    pub fn expiration(&self, q: &mut Query, ttl: i64) {
        match self {
            Dialect::Postgres => {
                q.text("CURRENT_TIMESTAMP AT TIME ZONE 'UTC' + CAST(")
                    .param(ttl.to_string())
                    .text(" AS INTERVAL)");
            }
            Dialect::MySql => {
                q.text("DATE_ADD(UTC_TIMESTAMP, INTERVAL ")
                    .param(ttl)
                    .text(" SECOND)");
            }
        }
    }

    /// UTC wall-clock "now", comparable against the `expiration` column.
    pub fn now(&self) -> &'static str {
        match self {
            Dialect::Postgres => "CURRENT_TIMESTAMP AT TIME ZONE 'UTC'",
            Dialect::MySql => "UTC_TIMESTAMP",
        }
    }

    /// Select expression for the seconds remaining until expiration.
    pub fn ttl(&self) -> &'static str {
        match self {
            Dialect::Postgres => {
                "CAST(EXTRACT(EPOCH FROM \"expiration\") - EXTRACT(EPOCH FROM CURRENT_TIMESTAMP) AS bigint)"
            }
            Dialect::MySql => "CAST(TIMESTAMPDIFF(SECOND, UTC_TIMESTAMP, \"expiration\") AS SIGNED)",
        }
    }

    /// Select expression for the expiration as Unix epoch seconds. The
    /// column holds UTC wall time, so MySQL gets a wall-clock difference
    /// rather than the session-timezone UNIX_TIMESTAMP.
    pub fn expiration_epoch(&self) -> &'static str {
        match self {
            Dialect::Postgres => "CAST(EXTRACT(EPOCH FROM \"expiration\") AS bigint)",
            Dialect::MySql => {
                "CAST(TIMESTAMPDIFF(SECOND, '1970-01-01 00:00:00', \"expiration\") AS SIGNED)"
            }
        }
    }

    /// Whether an insert failed because the row already exists:
    /// SQLSTATE 23505 on Postgres, errno 1062 (SQLSTATE 23000) on MySQL.
    pub fn is_duplicate_key(&self, err: &sqlx::Error) -> bool {
        let Some(db_err) = err.as_database_error() else {
            return false;
        };
        match self {
            Dialect::Postgres => db_err.code().as_deref() == Some("23505"),
            Dialect::MySql => {
                if let Some(mysql) = db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
                    mysql.number() == 1062
                } else {
                    db_err.code().as_deref() == Some("23000")
                }
            }
        }
    }
}
