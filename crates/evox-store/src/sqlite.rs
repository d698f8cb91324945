//! SQLite storage backend.
//!
//! Records live in a single `records` table keyed by `(collection, key)`
//! with the JSON document in `value`.  Scalar equality filters are pushed
//! down as `json_extract` predicates; filters on arrays or objects are
//! evaluated in process.

use async_trait::async_trait;
use evox_kernel::BackendKind;
use rusqlite::types::Value as SqlValue;
use rusqlite::{OptionalExtension, params, params_from_iter};
use serde_json::Value;

use crate::backend::{Query, StorageBackend};
use crate::db::Database;
use crate::error::StoreResult;

pub struct SqliteBackend {
    name: String,
    kind: BackendKind,
    db: Database,
}

impl SqliteBackend {
    /// Wrap a migrated database.  `kind` is normally [`BackendKind::Sql`].
    pub fn new(name: impl Into<String>, kind: BackendKind, db: Database) -> Self {
        Self {
            name: name.into(),
            kind,
            db,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

/// SQL predicate and bound value for one filter, or `None` when the filter
/// must be evaluated in process.
fn pushdown(field: &str, expected: &Value) -> Option<(String, Option<SqlValue>)> {
    let column = format!("json_extract(value, '$.{field}')");
    let bound = match expected {
        Value::Null => return Some((format!("{column} IS NULL"), None)),
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => SqlValue::Integer(i),
            (None, Some(f)) => SqlValue::Real(f),
            (None, None) => return None,
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => return None,
    };
    Some((format!("{column} = ?"), Some(bound)))
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn read(&self, collection: &str, key: &str) -> StoreResult<Option<Value>> {
        let (collection, key) = (collection.to_string(), key.to_string());
        let raw: Option<String> = self
            .db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT value FROM records WHERE collection = ?1 AND key = ?2",
                        params![collection, key],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        raw.map(|text| serde_json::from_str(&text).map_err(Into::into))
            .transpose()
    }

    async fn write(&self, collection: &str, key: &str, value: Value) -> StoreResult<()> {
        let (collection, key) = (collection.to_string(), key.to_string());
        let text = serde_json::to_string(&value)?;
        self.db
            .execute(move |conn| {
                let now = chrono::Utc::now().timestamp_millis();
                conn.execute(
                    "INSERT INTO records (collection, key, value, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT (collection, key)
                     DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    params![collection, key, text, now],
                )?;
                Ok(())
            })
            .await
    }

    async fn delete(&self, collection: &str, key: &str) -> StoreResult<bool> {
        let (collection, key) = (collection.to_string(), key.to_string());
        self.db
            .execute(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM records WHERE collection = ?1 AND key = ?2",
                    params![collection, key],
                )?;
                Ok(removed > 0)
            })
            .await
    }

    async fn query(&self, collection: &str, query: &Query) -> StoreResult<Vec<Value>> {
        query.validate()?;

        let pushed: Option<Vec<_>> = query
            .filters
            .iter()
            .map(|(field, expected)| pushdown(field, expected))
            .collect();

        let mut sql = String::from("SELECT value FROM records WHERE collection = ?");
        let mut binds = vec![SqlValue::Text(collection.to_string())];
        // Paging can only be pushed down together with every filter.
        let in_process = match pushed {
            Some(predicates) => {
                for (predicate, bound) in predicates {
                    sql.push_str(" AND ");
                    sql.push_str(&predicate);
                    binds.extend(bound);
                }
                false
            }
            None => true,
        };
        sql.push_str(" ORDER BY key");
        if !in_process && (query.limit.is_some() || query.offset.is_some()) {
            let limit = query.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
            let offset = query.offset.map_or(0, |o| i64::try_from(o).unwrap_or(i64::MAX));
            sql.push_str(" LIMIT ? OFFSET ?");
            binds.push(SqlValue::Integer(limit));
            binds.push(SqlValue::Integer(offset));
        }

        let rows: Vec<String> = self
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(binds), |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let records = rows
            .iter()
            .map(|text| serde_json::from_str(text))
            .collect::<Result<Vec<Value>, _>>()?;

        Ok(if in_process {
            query.apply(records)
        } else {
            records
        })
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.db
            .execute(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                Ok(())
            })
            .await
    }
}
