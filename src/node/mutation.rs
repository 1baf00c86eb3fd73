//! Replicated writes
//!
//! A `Mutation` is the unit that travels between nodes: it is applied on
//! the accepting node, copied to the replica with the accepting node's
//! `last_updated`, and persisted in the transaction log for replay.
//!
//! Copies that carry an explicit `last_updated` are idempotent: inserts
//! render as upserts, updates overwrite with the same values and deletes of
//! missing rows affect nothing. Replaying a copy twice converges to the same
//! row.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{encode_genres, NewTitle, Title, TitleChanges, TitleId};

/// Operation recorded in the transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(Operation::Insert),
            "UPDATE" => Some(Operation::Update),
            "DELETE" => Some(Operation::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write against the titles table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    Insert {
        id: TitleId,
        fields: NewTitle,
        /// `None` lets the node stamp the row.
        #[serde(default)]
        last_updated: Option<DateTime<Utc>>,
    },
    Update {
        id: TitleId,
        changes: TitleChanges,
        #[serde(default)]
        last_updated: Option<DateTime<Utc>>,
    },
    Delete {
        id: TitleId,
    },
}

impl Mutation {
    pub fn insert(id: TitleId, fields: NewTitle) -> Self {
        Mutation::Insert {
            id,
            fields,
            last_updated: None,
        }
    }

    pub fn update(id: TitleId, changes: TitleChanges) -> Self {
        Mutation::Update {
            id,
            changes,
            last_updated: None,
        }
    }

    pub fn delete(id: TitleId) -> Self {
        Mutation::Delete { id }
    }

    /// Upsert of a row exactly as stored on the accepting node.
    pub fn copy_of(title: &Title) -> Self {
        Mutation::Insert {
            id: title.id.clone(),
            fields: NewTitle {
                title_type: title.title_type,
                primary_title: title.primary_title.clone(),
                start_year: title.start_year,
                runtime_minutes: title.runtime_minutes,
                genres: title.genres.clone(),
            },
            last_updated: Some(title.last_updated),
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Mutation::Insert { .. } => Operation::Insert,
            Mutation::Update { .. } => Operation::Update,
            Mutation::Delete { .. } => Operation::Delete,
        }
    }

    pub fn record_id(&self) -> &TitleId {
        match self {
            Mutation::Insert { id, .. } | Mutation::Update { id, .. } | Mutation::Delete { id } => id,
        }
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        match self {
            Mutation::Insert { last_updated, .. } | Mutation::Update { last_updated, .. } => {
                *last_updated
            }
            Mutation::Delete { .. } => None,
        }
    }

    /// Same mutation pinned to the accepting node's timestamp.
    pub fn with_last_updated(&self, stamp: DateTime<Utc>) -> Self {
        match self {
            Mutation::Insert { id, fields, .. } => Mutation::Insert {
                id: id.clone(),
                fields: fields.clone(),
                last_updated: Some(stamp),
            },
            Mutation::Update { id, changes, .. } => Mutation::Update {
                id: id.clone(),
                changes: changes.clone(),
                last_updated: Some(stamp),
            },
            Mutation::Delete { id } => Mutation::Delete { id: id.clone() },
        }
    }

    /// Parameterized SQL for this mutation.
    pub fn statement(&self) -> Statement {
        match self {
            Mutation::Insert {
                id,
                fields,
                last_updated,
            } => insert_statement(id, fields, *last_updated),
            Mutation::Update {
                id,
                changes,
                last_updated,
            } => update_statement(id, changes, *last_updated),
            Mutation::Delete { id } => Statement {
                sql: "DELETE FROM titles WHERE tconst = ?".to_string(),
                params: vec![SqlValue::Text(id.to_string())],
            },
        }
    }
}

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Int(i64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

impl SqlValue {
    fn opt_int(value: Option<i32>) -> Self {
        value.map_or(SqlValue::Null, |v| SqlValue::Int(v as i64))
    }

    fn opt_text(value: Option<String>) -> Self {
        value.map_or(SqlValue::Null, SqlValue::Text)
    }
}

/// SQL text plus positional parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

const INSERT_COLUMNS: &str = "tconst, title_type, primary_title, start_year, runtime_minutes, genres";

fn insert_statement(id: &TitleId, fields: &NewTitle, stamp: Option<DateTime<Utc>>) -> Statement {
    let mut params = vec![
        SqlValue::Text(id.to_string()),
        SqlValue::Text(fields.title_type.as_str().to_string()),
        SqlValue::Text(fields.primary_title.clone()),
        SqlValue::opt_int(fields.start_year),
        SqlValue::opt_int(fields.runtime_minutes),
        SqlValue::opt_text(encode_genres(&fields.genres)),
    ];

    let sql = match stamp {
        None => format!("INSERT INTO titles ({}) VALUES (?, ?, ?, ?, ?, ?)", INSERT_COLUMNS),
        Some(stamp) => {
            params.push(SqlValue::Timestamp(stamp));
            format!(
                "INSERT INTO titles ({}, last_updated) VALUES (?, ?, ?, ?, ?, ?, ?) \
                 ON DUPLICATE KEY UPDATE title_type = VALUES(title_type), \
                 primary_title = VALUES(primary_title), start_year = VALUES(start_year), \
                 runtime_minutes = VALUES(runtime_minutes), genres = VALUES(genres), \
                 last_updated = VALUES(last_updated)",
                INSERT_COLUMNS
            )
        }
    };

    Statement { sql, params }
}

fn update_statement(
    id: &TitleId,
    changes: &TitleChanges,
    stamp: Option<DateTime<Utc>>,
) -> Statement {
    let mut assignments = Vec::new();
    let mut params = Vec::new();

    if let Some(title) = &changes.primary_title {
        assignments.push("primary_title = ?");
        params.push(SqlValue::Text(title.clone()));
    }
    if let Some(year) = changes.start_year {
        assignments.push("start_year = ?");
        params.push(SqlValue::Int(year as i64));
    }
    if let Some(minutes) = changes.runtime_minutes {
        assignments.push("runtime_minutes = ?");
        params.push(SqlValue::Int(minutes as i64));
    }
    if let Some(genres) = &changes.genres {
        assignments.push("genres = ?");
        params.push(SqlValue::opt_text(encode_genres(genres)));
    }
    match stamp {
        Some(stamp) => {
            assignments.push("last_updated = ?");
            params.push(SqlValue::Timestamp(stamp));
        }
        None => assignments.push("last_updated = CURRENT_TIMESTAMP"),
    }
    params.push(SqlValue::Text(id.to_string()));

    Statement {
        sql: format!("UPDATE titles SET {} WHERE tconst = ?", assignments.join(", ")),
        params,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TitleType;
    use chrono::TimeZone;

    fn stamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap()
    }

    #[test]
    fn test_accepting_insert_lets_node_stamp() {
        let m = Mutation::insert(TitleId::from_number(7), NewTitle::new(TitleType::Movie, "Heat"));
        let stmt = m.statement();
        assert!(stmt.sql.starts_with("INSERT INTO titles"));
        assert!(!stmt.sql.contains("last_updated"));
        assert_eq!(stmt.params.len(), 6);
        assert_eq!(stmt.params[0], SqlValue::Text("tt0000007".into()));
        assert_eq!(stmt.params[3], SqlValue::Null);
    }

    #[test]
    fn test_replica_insert_is_upsert_with_stamp() {
        let m = Mutation::insert(TitleId::from_number(7), NewTitle::new(TitleType::Movie, "Heat"))
            .with_last_updated(stamp());
        let stmt = m.statement();
        assert!(stmt.sql.contains("ON DUPLICATE KEY UPDATE"));
        assert_eq!(stmt.params.last(), Some(&SqlValue::Timestamp(stamp())));
    }

    #[test]
    fn test_update_statement_columns() {
        let changes = TitleChanges {
            primary_title: Some("Heat (1995)".into()),
            runtime_minutes: Some(170),
            ..Default::default()
        };
        let stmt = Mutation::update(TitleId::new("tt0113277"), changes.clone()).statement();
        assert_eq!(
            stmt.sql,
            "UPDATE titles SET primary_title = ?, runtime_minutes = ?, \
             last_updated = CURRENT_TIMESTAMP WHERE tconst = ?"
        );
        assert_eq!(stmt.params.len(), 3);

        let copy = Mutation::update(TitleId::new("tt0113277"), changes).with_last_updated(stamp());
        let stmt = copy.statement();
        assert!(stmt.sql.contains("last_updated = ?"));
        assert_eq!(stmt.params.len(), 4);
    }

    #[test]
    fn test_copy_of_row() {
        let title = NewTitle::new(TitleType::TvSeries, "Lost")
            .with_genres(["Drama"])
            .into_title(TitleId::from_number(411008), stamp());
        let copy = Mutation::copy_of(&title);
        assert_eq!(copy.operation(), Operation::Insert);
        assert_eq!(copy.record_id(), &title.id);
        assert_eq!(copy.last_updated(), Some(stamp()));
    }

    #[test]
    fn test_payload_roundtrip_keeps_tag() {
        let m = Mutation::delete(TitleId::new("tt1"));
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["op"], "delete");
        let back: Mutation = serde_json::from_value(json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::parse("UPDATE"), Some(Operation::Update));
        assert_eq!(Operation::Delete.to_string(), "DELETE");
        assert_eq!(Operation::parse("upsert"), None);
    }
}
