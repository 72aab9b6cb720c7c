use crate::calc::NaturalKey;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AuditAction {
    Recompute,
    Adjust,
    Release,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Recompute => "recompute",
            AuditAction::Adjust => "adjust",
            AuditAction::Release => "release",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub actor: Option<String>,
    pub action: String,
    pub student_id: String,
    pub class_id: String,
    pub subject: String,
    pub term: String,
    pub academic_year: String,
    pub details: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub student_id: Option<String>,
    pub class_id: Option<String>,
    pub limit: usize,
}

/// Appends one entry. Callers pass the open upsert transaction so the log row
/// commits or rolls back together with the carry mark it describes.
pub fn append(
    conn: &Connection,
    actor: Option<&str>,
    action: AuditAction,
    key: &NaturalKey,
    details: &serde_json::Value,
    created_at: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO audit_log(id, actor, action, student_id, class_id, subject, term, academic_year, details, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            uuid::Uuid::new_v4().to_string(),
            actor,
            action.as_str(),
            &key.student_id,
            &key.class_id,
            &key.subject,
            &key.term,
            &key.academic_year,
            details.to_string(),
            created_at,
        ),
    )?;
    Ok(())
}

pub fn list(conn: &Connection, filter: &AuditFilter) -> anyhow::Result<Vec<AuditEntry>> {
    let mut sql = String::from(
        "SELECT id, actor, action, student_id, class_id, subject, term, academic_year, details, created_at
         FROM audit_log WHERE 1 = 1",
    );
    let mut binds: Vec<Value> = Vec::new();
    if let Some(s) = &filter.student_id {
        sql.push_str(" AND student_id = ?");
        binds.push(Value::Text(s.clone()));
    }
    if let Some(c) = &filter.class_id {
        sql.push_str(" AND class_id = ?");
        binds.push(Value::Text(c.clone()));
    }
    sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ?");
    binds.push(Value::Integer(filter.limit as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            let details: String = r.get(8)?;
            Ok(AuditEntry {
                id: r.get(0)?,
                actor: r.get(1)?,
                action: r.get(2)?,
                student_id: r.get(3)?,
                class_id: r.get(4)?,
                subject: r.get(5)?,
                term: r.get(6)?,
                academic_year: r.get(7)?,
                details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
                created_at: r.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
