//! Postgres implementation of [`RecordStore`] on top of `sqlx`.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use batchload_core::{EntityDef, FieldDef, FieldKind, KeyValue, PrimaryKey, Record, Value};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};
use tracing::debug;

use crate::retry::{try_until_allowed, RetryPolicy};
use crate::{PageRequest, RecordStore, StoreError};

/// Postgres caps bind parameters per statement at 65535.
const MAX_BIND_PARAMS: usize = 65_535;

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool, retrying while the server refuses connections.
    pub async fn connect(
        options: PgConnectOptions,
        max_connections: u32,
        retry: &RetryPolicy,
    ) -> Result<Self, StoreError> {
        let pool = try_until_allowed(retry, "connect", || {
            let options = options.clone();
            async move {
                PgPoolOptions::new()
                    .max_connections(max_connections.max(1))
                    .test_before_acquire(true)
                    .idle_timeout(Some(Duration::from_secs(60)))
                    .connect_with(options)
                    .await
                    .map_err(|err| StoreError::from_sqlx("connect", err))
            }
        })
        .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_type(field: &FieldDef) -> String {
    match &field.kind {
        FieldKind::Integer if field.autoincrement => {
            "BIGINT GENERATED BY DEFAULT AS IDENTITY".to_string()
        }
        FieldKind::Integer => "BIGINT".to_string(),
        FieldKind::Float => "DOUBLE PRECISION".to_string(),
        FieldKind::Boolean => "BOOLEAN".to_string(),
        FieldKind::Text {
            max_length: Some(n),
        } => format!("VARCHAR({n})"),
        FieldKind::Text { max_length: None } => "TEXT".to_string(),
        FieldKind::Timestamp => "TIMESTAMPTZ".to_string(),
        FieldKind::Json => "JSONB".to_string(),
    }
}

fn key_columns(entity: &EntityDef) -> String {
    entity
        .primary_key_names()
        .iter()
        .map(|k| quote_ident(k))
        .collect::<Vec<_>>()
        .join(", ")
}

fn all_columns(entity: &EntityDef) -> String {
    entity
        .fields()
        .iter()
        .map(|f| quote_ident(&f.name))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn create_table_sql(entity: &EntityDef) -> String {
    let keys = entity.primary_key_names();
    let mut columns = entity
        .fields()
        .iter()
        .map(|field| {
            let not_null = !field.nullable || keys.contains(&field.name);
            format!(
                "{} {}{}",
                quote_ident(&field.name),
                column_type(field),
                if not_null { " NOT NULL" } else { "" }
            )
        })
        .collect::<Vec<_>>();
    columns.push(format!("PRIMARY KEY ({})", key_columns(entity)));
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(entity.name()),
        columns.join(", ")
    )
}

pub fn select_keys_sql(entity: &EntityDef) -> String {
    format!(
        "SELECT {} FROM {}",
        key_columns(entity),
        quote_ident(entity.name())
    )
}

pub fn exists_sql(entity: &EntityDef) -> String {
    let predicates = entity
        .primary_key_names()
        .iter()
        .enumerate()
        .map(|(i, k)| format!("{} = ${}", quote_ident(k), i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE {})",
        quote_ident(entity.name()),
        predicates
    )
}

/// Keyset page: `WHERE (k1, k2) > ($1, $2) ORDER BY k1, k2 LIMIT $n [OFFSET $m]`.
pub fn page_sql(entity: &EntityDef, keyed: bool, with_offset: bool) -> String {
    let key_count = entity.primary_key_names().len();
    let mut sql = format!(
        "SELECT {} FROM {}",
        all_columns(entity),
        quote_ident(entity.name())
    );
    let mut next_param = 1;
    if keyed {
        let params = (1..=key_count)
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" WHERE ({}) > ({})", key_columns(entity), params));
        next_param += key_count;
    }
    sql.push_str(&format!(
        " ORDER BY {} LIMIT ${}",
        key_columns(entity),
        next_param
    ));
    if with_offset {
        sql.push_str(&format!(" OFFSET ${}", next_param + 1));
    }
    sql
}

pub fn insert_sql(entity: &EntityDef, columns: &[&FieldDef], rows: usize) -> String {
    let names = columns
        .iter()
        .map(|f| quote_ident(&f.name))
        .collect::<Vec<_>>()
        .join(", ");
    let mut param = 0;
    let tuples = (0..rows)
        .map(|_| {
            let slots = columns
                .iter()
                .map(|_| {
                    param += 1;
                    format!("${param}")
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("({slots})")
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(entity.name()),
        names,
        tuples
    )
}

fn bind_value<'q>(query: PgQuery<'q>, kind: &FieldKind, value: &Value) -> PgQuery<'q> {
    match value {
        Value::Null => match kind {
            FieldKind::Integer => query.bind(None::<i64>),
            FieldKind::Float => query.bind(None::<f64>),
            FieldKind::Boolean => query.bind(None::<bool>),
            FieldKind::Text { .. } => query.bind(None::<String>),
            FieldKind::Timestamp => query.bind(None::<DateTime<Utc>>),
            FieldKind::Json => query.bind(None::<Json<JsonValue>>),
        },
        Value::Integer(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Boolean(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.clone()),
        Value::Timestamp(v) => query.bind(*v),
        Value::Json(v) => query.bind(Json(v.clone())),
    }
}

fn bind_key<'q>(query: PgQuery<'q>, key: &PrimaryKey) -> PgQuery<'q> {
    key.values().iter().fold(query, |query, value| match value {
        KeyValue::Integer(v) => query.bind(*v),
        KeyValue::Boolean(v) => query.bind(*v),
        KeyValue::Text(v) => query.bind(v.clone()),
        KeyValue::Timestamp(v) => query.bind(*v),
    })
}

fn decode_value(row: &PgRow, field: &FieldDef) -> Result<Value, sqlx::Error> {
    let name = field.name.as_str();
    let value = match &field.kind {
        FieldKind::Integer => row.try_get::<Option<i64>, _>(name)?.map(Value::Integer),
        FieldKind::Float => row.try_get::<Option<f64>, _>(name)?.map(Value::Float),
        FieldKind::Boolean => row.try_get::<Option<bool>, _>(name)?.map(Value::Boolean),
        FieldKind::Text { .. } => row.try_get::<Option<String>, _>(name)?.map(Value::Text),
        FieldKind::Timestamp => row
            .try_get::<Option<DateTime<Utc>>, _>(name)?
            .map(Value::Timestamp),
        FieldKind::Json => row
            .try_get::<Option<Json<JsonValue>>, _>(name)?
            .map(|json| Value::Json(json.0)),
    };
    Ok(value.unwrap_or(Value::Null))
}

fn decode_record(entity: &EntityDef, row: &PgRow) -> Result<Record, StoreError> {
    entity
        .fields()
        .iter()
        .map(|field| {
            decode_value(row, field)
                .map(|value| (field.name.clone(), value))
                .map_err(|err| StoreError::from_sqlx("read_page", err))
        })
        .collect()
}

fn decode_key(entity: &EntityDef, row: &PgRow) -> Result<PrimaryKey, StoreError> {
    let mut values = Vec::with_capacity(entity.primary_key_names().len());
    for field in entity.primary_key_fields() {
        let value = decode_value(row, field)
            .map_err(|err| StoreError::from_sqlx("fetch_primary_keys", err))?;
        let key = value.as_key().ok_or_else(|| StoreError::Malformed {
            operation: "fetch_primary_keys",
            message: format!("null key component `{}` in `{}`", field.name, entity.name()),
        })?;
        values.push(key);
    }
    Ok(PrimaryKey::new(values))
}

#[async_trait]
impl RecordStore for PgStore {
    async fn ensure_table(&self, entity: &EntityDef) -> Result<(), StoreError> {
        let sql = create_table_sql(entity);
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::from_sqlx("ensure_table", err))?;
        Ok(())
    }

    async fn fetch_primary_keys(
        &self,
        entity: &EntityDef,
    ) -> Result<HashSet<PrimaryKey>, StoreError> {
        let sql = select_keys_sql(entity);
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| StoreError::from_sqlx("fetch_primary_keys", err))?;
        rows.iter().map(|row| decode_key(entity, row)).collect()
    }

    async fn exists(&self, entity: &EntityDef, key: &PrimaryKey) -> Result<bool, StoreError> {
        let sql = exists_sql(entity);
        let row = bind_key(sqlx::query(&sql), key)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| StoreError::from_sqlx("exists", err))?;
        row.try_get::<bool, _>(0)
            .map_err(|err| StoreError::from_sqlx("exists", err))
    }

    async fn bulk_insert(&self, entity: &EntityDef, records: &[Record]) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let columns = entity
            .fields()
            .iter()
            .filter(|f| !f.autoincrement)
            .collect::<Vec<_>>();
        let sql_error = |err: sqlx::Error| StoreError::from_sqlx("bulk_insert", err);

        let mut tx = self.pool.begin().await.map_err(sql_error)?;
        let mut committed = 0u64;
        if columns.is_empty() {
            let sql = format!("INSERT INTO {} DEFAULT VALUES", quote_ident(entity.name()));
            for _ in records {
                let result = sqlx::query(&sql).execute(&mut *tx).await.map_err(sql_error)?;
                committed += result.rows_affected();
            }
        } else {
            let rows_per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);
            for chunk in records.chunks(rows_per_statement) {
                let sql = insert_sql(entity, &columns, chunk.len());
                let mut query = sqlx::query(&sql);
                for record in chunk {
                    for field in &columns {
                        let value = record.get(&field.name).unwrap_or(&Value::Null);
                        query = bind_value(query, &field.kind, value);
                    }
                }
                let result = query.execute(&mut *tx).await.map_err(sql_error)?;
                committed += result.rows_affected();
            }
        }
        tx.commit().await.map_err(sql_error)?;
        debug!(entity = entity.name(), committed, "bulk insert committed");
        Ok(committed)
    }

    async fn read_page(
        &self,
        entity: &EntityDef,
        page: &PageRequest,
    ) -> Result<Vec<Record>, StoreError> {
        let sql = page_sql(entity, page.after.is_some(), page.offset > 0);
        let mut query = sqlx::query(&sql);
        if let Some(after) = &page.after {
            query = bind_key(query, after);
        }
        query = query.bind(page.limit as i64);
        if page.offset > 0 {
            query = query.bind(page.offset as i64);
        }
        // One connection per page, returned to the pool before the caller sees
        // any rows, so no session outlives a chunk.
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| StoreError::from_sqlx("read_page", err))?;
        let rows = query
            .fetch_all(&mut *conn)
            .await
            .map_err(|err| StoreError::from_sqlx("read_page", err))?;
        drop(conn);
        rows.iter().map(|row| decode_record(entity, row)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indicators() -> EntityDef {
        EntityDef::new(
            "indicators",
            vec![
                FieldDef::new("country", FieldKind::Text { max_length: Some(3) }),
                FieldDef::new("year", FieldKind::Integer),
                FieldDef::new("value", FieldKind::Float).not_null(),
                FieldDef::new("meta", FieldKind::Json),
            ],
            vec!["country".into(), "year".into()],
        )
        .unwrap()
    }

    #[test]
    fn create_table_declares_types_and_key() {
        assert_eq!(
            create_table_sql(&indicators()),
            "CREATE TABLE IF NOT EXISTS \"indicators\" (\"country\" VARCHAR(3) NOT NULL, \
             \"year\" BIGINT NOT NULL, \"value\" DOUBLE PRECISION NOT NULL, \"meta\" JSONB, \
             PRIMARY KEY (\"country\", \"year\"))"
        );
    }

    #[test]
    fn autoincrement_columns_use_identity() {
        let events = EntityDef::new(
            "events",
            vec![FieldDef::new("id", FieldKind::Integer).autoincrement()],
            vec!["id".into()],
        )
        .unwrap();
        assert!(create_table_sql(&events).contains("\"id\" BIGINT GENERATED BY DEFAULT AS IDENTITY NOT NULL"));
    }

    #[test]
    fn exists_filters_on_every_key_column() {
        assert_eq!(
            exists_sql(&indicators()),
            "SELECT EXISTS(SELECT 1 FROM \"indicators\" WHERE \"country\" = $1 AND \"year\" = $2)"
        );
    }

    #[test]
    fn pages_are_keyset_ordered() {
        let entity = indicators();
        assert_eq!(
            page_sql(&entity, false, false),
            "SELECT \"country\", \"year\", \"value\", \"meta\" FROM \"indicators\" \
             ORDER BY \"country\", \"year\" LIMIT $1"
        );
        assert_eq!(
            page_sql(&entity, true, false),
            "SELECT \"country\", \"year\", \"value\", \"meta\" FROM \"indicators\" \
             WHERE (\"country\", \"year\") > ($1, $2) ORDER BY \"country\", \"year\" LIMIT $3"
        );
        assert!(page_sql(&entity, false, true).ends_with("LIMIT $1 OFFSET $2"));
    }

    #[test]
    fn insert_numbers_parameters_row_by_row() {
        let entity = indicators();
        let columns = entity.fields().iter().take(2).collect::<Vec<_>>();
        assert_eq!(
            insert_sql(&entity, &columns, 2),
            "INSERT INTO \"indicators\" (\"country\", \"year\") VALUES ($1, $2), ($3, $4)"
        );
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
