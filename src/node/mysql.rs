//! MySQL backend
//!
//! Each session is one dedicated `MySqlConnection`. Transactions are driven
//! with plain `START TRANSACTION`/`COMMIT`/`ROLLBACK` so a session can hold
//! locks across several calls, which a pooled connection cannot guarantee.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySql, MySqlArguments, MySqlConnectOptions, MySqlDatabaseError, MySqlRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Connection, Executor, MySqlConnection, QueryBuilder, Row};
use tracing::debug;

use super::config::{NodeConfig, NodeId};
use super::errors::{NodeError, NodeResult};
use super::isolation::IsolationLevel;
use super::mutation::{Mutation, Operation, SqlValue};
use super::session::{Connector, LogQuery, NodeSession, ReadMode};
use crate::model::{decode_genres, Title, TitleFilter, TitleId, TitleQuery, TitleType};
use crate::txlog::{TransactionId, TransactionLogEntry, TxStatus};

const CREATE_TITLES: &str = "CREATE TABLE IF NOT EXISTS titles (
    tconst VARCHAR(16) NOT NULL PRIMARY KEY,
    title_type VARCHAR(32) NOT NULL,
    primary_title VARCHAR(512) NOT NULL,
    start_year INT NULL,
    runtime_minutes INT NULL,
    genres VARCHAR(255) NULL,
    last_updated TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    INDEX idx_titles_type (title_type),
    INDEX idx_titles_year (start_year)
)";

const CREATE_TRANSACTION_LOG: &str = "CREATE TABLE IF NOT EXISTS transaction_log (
    transaction_id CHAR(36) NOT NULL PRIMARY KEY,
    source_node VARCHAR(64) NOT NULL,
    target_node VARCHAR(64) NOT NULL,
    operation VARCHAR(10) NOT NULL,
    record_id VARCHAR(16) NOT NULL,
    statement TEXT NOT NULL,
    params JSON NOT NULL,
    payload JSON NOT NULL,
    status VARCHAR(10) NOT NULL,
    retry_count INT NOT NULL DEFAULT 0,
    max_retries INT NOT NULL,
    error_message TEXT NULL,
    created_at TIMESTAMP(6) NOT NULL,
    updated_at TIMESTAMP(6) NOT NULL,
    INDEX idx_transaction_log_status (status, created_at)
)";

const TITLE_COLUMNS: &str =
    "SELECT tconst, title_type, primary_title, start_year, runtime_minutes, genres, last_updated FROM titles";

const LOG_COLUMNS: &str = "SELECT transaction_id, source_node, target_node, operation, record_id, \
     statement, params, payload, status, retry_count, max_retries, error_message, created_at, \
     updated_at FROM transaction_log";

const MAX_KEY: &str = "SELECT MAX(CAST(SUBSTRING(tconst, 3) AS UNSIGNED)) FROM titles WHERE tconst LIKE 'tt%'";

/// Opens MySQL sessions.
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    connect_timeout: Duration,
}

impl MySqlConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn open(
        &self,
        node: &NodeConfig,
        isolation: IsolationLevel,
    ) -> NodeResult<Box<dyn NodeSession>> {
        let options = MySqlConnectOptions::new()
            .host(&node.host)
            .port(node.port)
            .username(&node.user)
            .password(&node.password)
            .database(&node.database);

        let mut conn = tokio::time::timeout(self.connect_timeout, MySqlConnection::connect_with(&options))
            .await
            .map_err(|_| NodeError::unavailable(&node.id, "connect timed out"))?
            .map_err(|e| NodeError::unavailable(&node.id, e.to_string()))?;

        let set_level = format!("SET SESSION TRANSACTION ISOLATION LEVEL {}", isolation.as_sql());
        conn.execute(sqlx::raw_sql(&set_level))
            .await
            .map_err(|e| classify(&node.id, e))?;

        debug!(node = %node.id, address = %node.address(), isolation = %isolation, "session opened");

        Ok(Box::new(MySqlSession {
            node: node.id.clone(),
            isolation,
            conn,
        }))
    }
}

/// One MySQL connection at a fixed isolation level.
pub struct MySqlSession {
    node: NodeId,
    isolation: IsolationLevel,
    conn: MySqlConnection,
}

impl MySqlSession {
    async fn raw(&mut self, sql: &str) -> NodeResult<()> {
        self.conn
            .execute(sqlx::raw_sql(sql))
            .await
            .map(|_| ())
            .map_err(|e| classify(&self.node, e))
    }

    fn err(&self) -> impl Fn(sqlx::Error) -> NodeError + '_ {
        move |e| classify(&self.node, e)
    }
}

#[async_trait]
impl NodeSession for MySqlSession {
    fn node_id(&self) -> &NodeId {
        &self.node
    }

    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    async fn ping(&mut self) -> NodeResult<()> {
        self.conn.ping().await.map_err(|e| classify(&self.node, e))
    }

    async fn begin(&mut self) -> NodeResult<()> {
        self.raw("START TRANSACTION").await
    }

    async fn commit(&mut self) -> NodeResult<()> {
        self.raw("COMMIT").await
    }

    async fn rollback(&mut self) -> NodeResult<()> {
        self.raw("ROLLBACK").await
    }

    async fn apply(&mut self, mutation: &Mutation) -> NodeResult<u64> {
        let statement = mutation.statement();
        let result = bind_params(sqlx::query(&statement.sql), &statement.params)
            .execute(&mut self.conn)
            .await
            .map_err(|e| classify(&self.node, e))?;
        Ok(result.rows_affected())
    }

    async fn fetch_title(&mut self, id: &TitleId, mode: ReadMode) -> NodeResult<Option<Title>> {
        let sql = format!("{} WHERE tconst = ?{}", TITLE_COLUMNS, lock_clause(mode));
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&mut self.conn)
            .await
            .map_err(|e| classify(&self.node, e))?;
        row.map(|r| title_from_row(&self.node, &r)).transpose()
    }

    async fn max_title_number(&mut self, mode: ReadMode) -> NodeResult<Option<u64>> {
        let sql = format!("{}{}", MAX_KEY, lock_clause(mode));
        let row = sqlx::query(&sql)
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| classify(&self.node, e))?;
        row.try_get::<Option<u64>, _>(0).map_err(self.err())
    }

    async fn query_titles(&mut self, query: &TitleQuery) -> NodeResult<Vec<Title>> {
        let mut builder = QueryBuilder::<MySql>::new(TITLE_COLUMNS);
        push_filter(&mut builder, &query.filter);
        builder
            .push(" ORDER BY ")
            .push(query.sort.column())
            .push(" DESC, CAST(SUBSTRING(tconst, 3) AS UNSIGNED) DESC, tconst DESC");
        if let Some(window) = query.window {
            builder
                .push(" LIMIT ")
                .push_bind(window.limit)
                .push(" OFFSET ")
                .push_bind(window.offset);
        }

        let rows = builder
            .build()
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| classify(&self.node, e))?;
        rows.iter().map(|r| title_from_row(&self.node, r)).collect()
    }

    async fn count_titles(&mut self, filter: &TitleFilter) -> NodeResult<u64> {
        let mut builder = QueryBuilder::<MySql>::new("SELECT COUNT(*) FROM titles");
        push_filter(&mut builder, filter);
        let row = builder
            .build()
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| classify(&self.node, e))?;
        let count: i64 = row.try_get(0).map_err(self.err())?;
        Ok(count.max(0) as u64)
    }

    async fn append_log(&mut self, entry: &TransactionLogEntry) -> NodeResult<()> {
        sqlx::query(
            "INSERT INTO transaction_log (transaction_id, source_node, target_node, operation, \
             record_id, statement, params, payload, status, retry_count, max_retries, \
             error_message, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.transaction_id.to_string())
        .bind(entry.source_node.as_str())
        .bind(entry.target_node.as_str())
        .bind(entry.operation.as_str())
        .bind(entry.record_id.as_str())
        .bind(entry.statement.as_str())
        .bind(Json(&entry.params))
        .bind(Json(&entry.payload))
        .bind(entry.status.as_str())
        .bind(entry.retry_count)
        .bind(entry.max_retries)
        .bind(entry.error_message.as_deref())
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&mut self.conn)
        .await
        .map_err(|e| classify(&self.node, e))?;
        Ok(())
    }

    async fn set_log_status(
        &mut self,
        id: &TransactionId,
        status: TxStatus,
        error: Option<&str>,
    ) -> NodeResult<bool> {
        let result = sqlx::query(
            "UPDATE transaction_log SET status = ?, \
             error_message = COALESCE(?, error_message), updated_at = ? \
             WHERE transaction_id = ? AND status = 'PENDING'",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&mut self.conn)
        .await
        .map_err(|e| classify(&self.node, e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn bump_log_retry(&mut self, id: &TransactionId) -> NodeResult<bool> {
        let result = sqlx::query(
            "UPDATE transaction_log SET retry_count = retry_count + 1, updated_at = ? \
             WHERE transaction_id = ?",
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&mut self.conn)
        .await
        .map_err(|e| classify(&self.node, e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn select_logs(&mut self, query: LogQuery) -> NodeResult<Vec<TransactionLogEntry>> {
        let rows = match query {
            LogQuery::Pending | LogQuery::Failed => {
                let status = if query == LogQuery::Pending {
                    TxStatus::Pending
                } else {
                    TxStatus::Failed
                };
                let sql = format!("{} WHERE status = ? ORDER BY created_at ASC", LOG_COLUMNS);
                sqlx::query(&sql)
                    .bind(status.as_str())
                    .fetch_all(&mut self.conn)
                    .await
            }
            LogQuery::Recent(limit) => {
                let sql = format!("{} ORDER BY created_at DESC LIMIT ?", LOG_COLUMNS);
                sqlx::query(&sql).bind(limit).fetch_all(&mut self.conn).await
            }
        }
        .map_err(|e| classify(&self.node, e))?;

        rows.iter().map(|r| log_entry_from_row(&self.node, r)).collect()
    }

    async fn ensure_schema(&mut self) -> NodeResult<()> {
        self.raw(CREATE_TITLES).await?;
        self.raw(CREATE_TRANSACTION_LOG).await
    }
}

fn lock_clause(mode: ReadMode) -> &'static str {
    match mode {
        ReadMode::Plain => "",
        ReadMode::ForUpdate => " FOR UPDATE",
    }
}

fn bind_params<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    params: &'q [SqlValue],
) -> Query<'q, MySql, MySqlArguments> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Timestamp(t) => query.bind(*t),
            SqlValue::Text(s) => query.bind(s.as_str()),
        };
    }
    query
}

fn push_filter(builder: &mut QueryBuilder<'_, MySql>, filter: &TitleFilter) {
    builder.push(" WHERE 1 = 1");
    if let Some(title_type) = filter.title_type {
        builder.push(" AND title_type = ").push_bind(title_type.as_str());
    }
    if let Some(pattern) = filter.like_pattern() {
        builder.push(" AND primary_title LIKE ").push_bind(pattern);
    }
    if let Some(from) = filter.year_from {
        builder.push(" AND start_year >= ").push_bind(from);
    }
    if let Some(to) = filter.year_to {
        builder.push(" AND start_year <= ").push_bind(to);
    }
    for genre in &filter.genres {
        builder
            .push(" AND FIND_IN_SET(")
            .push_bind(genre.clone())
            .push(", genres) > 0");
    }
}

fn title_from_row(node: &NodeId, row: &MySqlRow) -> NodeResult<Title> {
    let decode = |e: sqlx::Error| classify(node, e);
    let raw_type: String = row.try_get("title_type").map_err(decode)?;
    let title_type: TitleType = raw_type
        .parse()
        .map_err(|e: crate::model::ModelError| NodeError::query(node, e.to_string()))?;
    let genres: Option<String> = row.try_get("genres").map_err(decode)?;

    Ok(Title {
        id: TitleId::new(row.try_get::<String, _>("tconst").map_err(decode)?),
        title_type,
        primary_title: row.try_get("primary_title").map_err(decode)?,
        start_year: row.try_get("start_year").map_err(decode)?,
        runtime_minutes: row.try_get("runtime_minutes").map_err(decode)?,
        genres: decode_genres(genres.as_deref()),
        last_updated: row.try_get::<DateTime<Utc>, _>("last_updated").map_err(decode)?,
    })
}

fn log_entry_from_row(node: &NodeId, row: &MySqlRow) -> NodeResult<TransactionLogEntry> {
    let decode = |e: sqlx::Error| classify(node, e);
    let invalid = |column: &str, value: &str| {
        NodeError::query(node, format!("invalid {} in transaction_log: {}", column, value))
    };

    let raw_id: String = row.try_get("transaction_id").map_err(decode)?;
    let raw_operation: String = row.try_get("operation").map_err(decode)?;
    let raw_status: String = row.try_get("status").map_err(decode)?;
    let Json(params): Json<Vec<SqlValue>> = row.try_get("params").map_err(decode)?;
    let Json(payload): Json<Mutation> = row.try_get("payload").map_err(decode)?;

    Ok(TransactionLogEntry {
        transaction_id: raw_id
            .parse()
            .map_err(|_| invalid("transaction_id", &raw_id))?,
        source_node: NodeId::new(row.try_get::<String, _>("source_node").map_err(decode)?),
        target_node: NodeId::new(row.try_get::<String, _>("target_node").map_err(decode)?),
        operation: Operation::parse(&raw_operation)
            .ok_or_else(|| invalid("operation", &raw_operation))?,
        record_id: TitleId::new(row.try_get::<String, _>("record_id").map_err(decode)?),
        statement: row.try_get("statement").map_err(decode)?,
        params,
        payload,
        status: TxStatus::parse(&raw_status).ok_or_else(|| invalid("status", &raw_status))?,
        retry_count: row.try_get::<i32, _>("retry_count").map_err(decode)?.max(0) as u32,
        max_retries: row.try_get::<i32, _>("max_retries").map_err(decode)?.max(0) as u32,
        error_message: row.try_get("error_message").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

/// Maps driver errors onto node error kinds.
fn classify(node: &NodeId, err: sqlx::Error) -> NodeError {
    match &err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            match db.try_downcast_ref::<MySqlDatabaseError>().map(|e| e.number()) {
                Some(1213) => NodeError::deadlock(node, message),
                Some(1205) => NodeError::lock_timeout(node, message),
                Some(1062) => NodeError::constraint(node, message),
                // server shutdown in progress, connection killed
                Some(1053) | Some(1927) => NodeError::unavailable(node, message),
                _ => NodeError::query(node, message),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => NodeError::unavailable(node, err.to_string()),
        _ => NodeError::query(node, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_are_unavailable() {
        let node = NodeId::new("central");
        let err = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(classify(&node, err).is_unavailable());
        assert!(classify(&node, sqlx::Error::PoolTimedOut).is_unavailable());
    }

    #[test]
    fn test_decode_errors_are_query_errors() {
        let node = NodeId::new("central");
        let err = classify(&node, sqlx::Error::RowNotFound);
        assert_eq!(err.kind, crate::node::NodeErrorKind::Query);
    }

    #[test]
    fn test_lock_clause() {
        assert_eq!(lock_clause(ReadMode::Plain), "");
        assert_eq!(lock_clause(ReadMode::ForUpdate), " FOR UPDATE");
    }
}
