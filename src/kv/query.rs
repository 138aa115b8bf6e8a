use sqlx::any::{AnyQueryResult, AnyRow};
use sqlx::Any;

use crate::kv::dialect::Dialect;

/// An owned bind parameter. The `Any` driver only speaks a handful of
/// scalar kinds, which is all the schema needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Text(String),
    Bool(bool),
    Null,
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<Option<i64>> for Value {
    fn from(v: Option<i64>) -> Value {
        match v {
            Some(v) => Value::Int(v),
            None => Value::Null,
        }
    }
}

/// Stitches text fragments and parameters into one dialect-correct
/// statement: `?` placeholders for MySQL, numbered `$N` for Postgres.
#[derive(Debug, Clone)]
pub struct Query {
    sql: String,
    params: Vec<Value>,
    dialect: Dialect,
}

impl Query {
    pub fn new(dialect: Dialect) -> Query {
        Query {
            sql: String::new(),
            params: Vec::new(),
            dialect,
        }
    }

    pub fn text(&mut self, text: &str) -> &mut Query {
        self.sql.push_str(text);
        self
    }

    /// Pushes a parameter and renders its placeholder in place.
    pub fn param(&mut self, value: impl Into<Value>) -> &mut Query {
        self.params.push(value.into());
        let placeholder = self.dialect.placeholder(self.params.len());
        self.sql.push_str(&placeholder);
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    fn build(&self) -> sqlx::query::Query<'_, Any, sqlx::any::AnyArguments<'_>> {
        let mut query = sqlx::query(&self.sql);
        for param in &self.params {
            query = match param {
                Value::Int(v) => query.bind(*v),
                Value::Text(v) => query.bind(v.clone()),
                Value::Bool(v) => query.bind(*v),
                Value::Null => query.bind(None::<i64>),
            };
        }
        query
    }

    pub async fn execute<'e, E>(&self, executor: E) -> sqlx::Result<AnyQueryResult>
    where
        E: sqlx::Executor<'e, Database = Any>,
    {
        self.build().execute(executor).await
    }

    pub async fn fetch_all<'e, E>(&self, executor: E) -> sqlx::Result<Vec<AnyRow>>
    where
        E: sqlx::Executor<'e, Database = Any>,
    {
        self.build().fetch_all(executor).await
    }

    pub async fn fetch_optional<'e, E>(&self, executor: E) -> sqlx::Result<Option<AnyRow>>
    where
        E: sqlx::Executor<'e, Database = Any>,
    {
        self.build().fetch_optional(executor).await
    }

    pub async fn fetch_one<'e, E>(&self, executor: E) -> sqlx::Result<AnyRow>
    where
        E: sqlx::Executor<'e, Database = Any>,
    {
        self.build().fetch_one(executor).await
    }
}
