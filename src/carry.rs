//! Carry-mark upsert coordination.
//!
//! A carry mark is identified by its natural key. `recompute` regenerates the
//! derived fields from the record stores; `adjust` writes caller-supplied
//! values and remembers which fields were set by hand so later recomputes
//! leave them alone. Every write is a read-modify-write inside one
//! `BEGIN IMMEDIATE` transaction, so two writers for the same key serialize on
//! the database write lock instead of losing each other's updates.

use crate::audit::{self, AuditAction};
use crate::calc::{self, Components, NaturalKey, ScoringPolicy, Weights};
use crate::error::EngineError;
use crate::store::SqliteRecordSource;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::time::Duration;

const RETRY_BACKOFF_MS: u64 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CarryField {
    AssessmentAverage,
    AssignmentAverage,
    AttendancePercentage,
    FinalScore,
    Grade,
}

impl CarryField {
    pub const ALL: [CarryField; 5] = [
        CarryField::AssessmentAverage,
        CarryField::AssignmentAverage,
        CarryField::AttendancePercentage,
        CarryField::FinalScore,
        CarryField::Grade,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CarryField::AssessmentAverage => "assessmentAverage",
            CarryField::AssignmentAverage => "assignmentAverage",
            CarryField::AttendancePercentage => "attendancePercentage",
            CarryField::FinalScore => "finalScore",
            CarryField::Grade => "grade",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == s)
    }
}

/// The five values a carry mark carries, computed or adjusted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CarryValues {
    pub assessment_average: Option<f64>,
    pub assignment_average: Option<f64>,
    pub attendance_percentage: Option<f64>,
    pub final_score: Option<f64>,
    pub grade: Option<String>,
}

impl CarryValues {
    fn from_computation(components: &Components, reduction: Option<&calc::Reduction>) -> Self {
        Self {
            assessment_average: components.assessment_average,
            assignment_average: components.assignment_average,
            attendance_percentage: Some(components.attendance_percentage),
            final_score: reduction.map(|r| r.final_score),
            grade: reduction.and_then(|r| r.grade.clone()),
        }
    }

    /// Takes every field from `fresh` except those in `keep`, which stay as
    /// they are in `self`.
    fn merged_with(&self, fresh: &CarryValues, keep: &BTreeSet<CarryField>) -> CarryValues {
        let pick_num = |field: CarryField, old: Option<f64>, new: Option<f64>| {
            if keep.contains(&field) {
                old
            } else {
                new
            }
        };
        CarryValues {
            assessment_average: pick_num(
                CarryField::AssessmentAverage,
                self.assessment_average,
                fresh.assessment_average,
            ),
            assignment_average: pick_num(
                CarryField::AssignmentAverage,
                self.assignment_average,
                fresh.assignment_average,
            ),
            attendance_percentage: pick_num(
                CarryField::AttendancePercentage,
                self.attendance_percentage,
                fresh.attendance_percentage,
            ),
            final_score: pick_num(CarryField::FinalScore, self.final_score, fresh.final_score),
            grade: if keep.contains(&CarryField::Grade) {
                self.grade.clone()
            } else {
                fresh.grade.clone()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CarryMarkRecord {
    pub id: String,
    #[serde(flatten)]
    pub key: NaturalKey,
    #[serde(flatten)]
    pub values: CarryValues,
    pub weights: Weights,
    pub manually_adjusted_fields: BTreeSet<CarryField>,
    pub computed_at: String,
    pub version: i64,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum RecomputeOutcome {
    Computed { record: CarryMarkRecord },
    NoData,
}

/// Caller-supplied overrides. Only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdjustPatch {
    pub assessment_average: Option<f64>,
    pub assignment_average: Option<f64>,
    pub attendance_percentage: Option<f64>,
    pub final_score: Option<f64>,
    pub grade: Option<String>,
}

impl AdjustPatch {
    pub fn fields(&self) -> BTreeSet<CarryField> {
        let mut out = BTreeSet::new();
        if self.assessment_average.is_some() {
            out.insert(CarryField::AssessmentAverage);
        }
        if self.assignment_average.is_some() {
            out.insert(CarryField::AssignmentAverage);
        }
        if self.attendance_percentage.is_some() {
            out.insert(CarryField::AttendancePercentage);
        }
        if self.final_score.is_some() {
            out.insert(CarryField::FinalScore);
        }
        if self.grade.is_some() {
            out.insert(CarryField::Grade);
        }
        out
    }

    fn apply_to(&self, values: &mut CarryValues) {
        if let Some(v) = self.assessment_average {
            values.assessment_average = Some(v);
        }
        if let Some(v) = self.assignment_average {
            values.assignment_average = Some(v);
        }
        if let Some(v) = self.attendance_percentage {
            values.attendance_percentage = Some(v);
        }
        if let Some(v) = self.final_score {
            values.final_score = Some(calc::round_2dp(v));
        }
        if let Some(g) = &self.grade {
            values.grade = Some(g.clone());
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteOptions<'a> {
    pub actor: Option<&'a str>,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CarryMarkFilter {
    pub subject: Option<String>,
    pub term: Option<String>,
    pub academic_year: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRecompute {
    pub computed: Vec<CarryMarkRecord>,
    pub no_data: Vec<String>,
}

/// What the merge step wants written, if anything.
struct PendingWrite {
    values: CarryValues,
    weights: Weights,
    adjusted: BTreeSet<CarryField>,
    details: serde_json::Value,
}

enum UpsertError {
    Busy(rusqlite::Error),
    Engine(EngineError),
}

impl From<rusqlite::Error> for UpsertError {
    fn from(e: rusqlite::Error) -> Self {
        if is_busy(&e) {
            UpsertError::Busy(e)
        } else {
            UpsertError::Engine(EngineError::Storage(e))
        }
    }
}

impl From<EngineError> for UpsertError {
    fn from(e: EngineError) -> Self {
        UpsertError::Engine(e)
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == ErrorCode::DatabaseBusy || f.code == ErrorCode::DatabaseLocked
    )
}

fn etag_for(
    key: &NaturalKey,
    values: &CarryValues,
    weights: &Weights,
    adjusted: &BTreeSet<CarryField>,
) -> String {
    let canonical = json!({
        "key": key,
        "values": values,
        "weights": weights,
        "manuallyAdjustedFields": adjusted,
    });
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

const RECORD_COLUMNS: &str = "id, student_id, class_id, subject, term, academic_year,
    assessment_average, assignment_average, attendance_percentage,
    weight_assessment, weight_assignment, weight_attendance,
    final_score, grade, manually_adjusted, computed_at, version, etag";

fn record_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<CarryMarkRecord> {
    let adjusted_raw: String = r.get(14)?;
    let manually_adjusted_fields: BTreeSet<CarryField> = serde_json::from_str(&adjusted_raw)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(14, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(CarryMarkRecord {
        id: r.get(0)?,
        key: NaturalKey {
            student_id: r.get(1)?,
            class_id: r.get(2)?,
            subject: r.get(3)?,
            term: r.get(4)?,
            academic_year: r.get(5)?,
        },
        values: CarryValues {
            assessment_average: r.get(6)?,
            assignment_average: r.get(7)?,
            attendance_percentage: r.get(8)?,
            final_score: r.get(12)?,
            grade: r.get(13)?,
        },
        weights: Weights {
            assessment: r.get(9)?,
            assignment: r.get(10)?,
            attendance: r.get(11)?,
        },
        manually_adjusted_fields,
        computed_at: r.get(15)?,
        version: r.get(16)?,
        etag: r.get(17)?,
    })
}

pub fn get(conn: &Connection, key: &NaturalKey) -> Result<Option<CarryMarkRecord>, EngineError> {
    conn.query_row(
        &format!(
            "SELECT {RECORD_COLUMNS} FROM carry_marks
             WHERE student_id = ? AND class_id = ? AND subject = ? AND term = ? AND academic_year = ?"
        ),
        (
            &key.student_id,
            &key.class_id,
            &key.subject,
            &key.term,
            &key.academic_year,
        ),
        record_from_row,
    )
    .optional()
    .map_err(EngineError::Storage)
}

fn list_where(
    conn: &Connection,
    column: &str,
    id: &str,
    filter: &CarryMarkFilter,
    order_by: &str,
) -> Result<Vec<CarryMarkRecord>, EngineError> {
    let mut sql = format!(
        "SELECT {} FROM carry_marks cm
         LEFT JOIN students s ON s.id = cm.student_id
         WHERE cm.{} = ?",
        RECORD_COLUMNS
            .split(',')
            .map(|c| format!("cm.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", "),
        column
    );
    let mut binds: Vec<Value> = vec![Value::Text(id.to_string())];
    for (col, v) in [
        ("subject", &filter.subject),
        ("term", &filter.term),
        ("academic_year", &filter.academic_year),
    ] {
        if let Some(v) = v {
            sql.push_str(&format!(" AND cm.{} = ?", col));
            binds.push(Value::Text(v.clone()));
        }
    }
    sql.push_str(" ORDER BY ");
    sql.push_str(order_by);

    let mut stmt = conn.prepare(&sql).map_err(EngineError::Storage)?;
    let rows = stmt
        .query_map(params_from_iter(binds), record_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(EngineError::Storage)?;
    Ok(rows)
}

pub fn list_by_student(
    conn: &Connection,
    student_id: &str,
    filter: &CarryMarkFilter,
) -> Result<Vec<CarryMarkRecord>, EngineError> {
    list_where(
        conn,
        "student_id",
        student_id,
        filter,
        "cm.academic_year, cm.term, cm.subject",
    )
}

pub fn list_by_class(
    conn: &Connection,
    class_id: &str,
    filter: &CarryMarkFilter,
) -> Result<Vec<CarryMarkRecord>, EngineError> {
    list_where(
        conn,
        "class_id",
        class_id,
        filter,
        "COALESCE(s.name, cm.student_id), cm.subject, cm.academic_year, cm.term",
    )
}

/// Runs `merge` against the current record inside one immediate transaction
/// and writes what it returns. Busy/locked errors retry the whole
/// transaction with linear back-off up to `opts.max_attempts`.
fn upsert_with<F>(
    conn: &mut Connection,
    key: &NaturalKey,
    action: AuditAction,
    opts: WriteOptions<'_>,
    mut merge: F,
) -> Result<Option<CarryMarkRecord>, EngineError>
where
    F: FnMut(Option<&CarryMarkRecord>) -> Result<Option<PendingWrite>, EngineError>,
{
    let max_attempts = opts.max_attempts.max(1);
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match try_upsert(conn, key, action, opts.actor, &mut merge) {
            Ok(v) => return Ok(v),
            Err(UpsertError::Busy(e)) if attempt < max_attempts => {
                tracing::warn!(
                    attempt,
                    max_attempts,
                    error = %e,
                    student_id = %key.student_id,
                    subject = %key.subject,
                    "carry mark write lock busy; retrying"
                );
                std::thread::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64));
            }
            Err(UpsertError::Busy(_)) => {
                return Err(EngineError::ConcurrentUpdateConflict { attempts: attempt });
            }
            Err(UpsertError::Engine(e)) => return Err(e),
        }
    }
}

fn try_upsert<F>(
    conn: &mut Connection,
    key: &NaturalKey,
    action: AuditAction,
    actor: Option<&str>,
    merge: &mut F,
) -> Result<Option<CarryMarkRecord>, UpsertError>
where
    F: FnMut(Option<&CarryMarkRecord>) -> Result<Option<PendingWrite>, EngineError>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let prior = get(&tx, key).map_err(|e| match e {
        EngineError::Storage(inner) => UpsertError::from(inner),
        other => UpsertError::Engine(other),
    })?;

    // Dropping `tx` on the early returns rolls back.
    let Some(pending) = merge(prior.as_ref())? else {
        return Ok(None);
    };

    let now = chrono::Utc::now().to_rfc3339();
    let id = prior
        .as_ref()
        .map(|p| p.id.clone())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let version = prior.as_ref().map(|p| p.version + 1).unwrap_or(1);
    let etag = etag_for(key, &pending.values, &pending.weights, &pending.adjusted);
    let adjusted_json = serde_json::to_string(&pending.adjusted)
        .map_err(|e| UpsertError::Engine(EngineError::DataUnavailable(e.to_string())))?;

    tx.execute(
        "INSERT INTO carry_marks(
            id, student_id, class_id, subject, term, academic_year,
            assessment_average, assignment_average, attendance_percentage,
            weight_assessment, weight_assignment, weight_attendance,
            final_score, grade, manually_adjusted, version, etag, computed_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, class_id, subject, term, academic_year) DO UPDATE SET
            assessment_average = excluded.assessment_average,
            assignment_average = excluded.assignment_average,
            attendance_percentage = excluded.attendance_percentage,
            weight_assessment = excluded.weight_assessment,
            weight_assignment = excluded.weight_assignment,
            weight_attendance = excluded.weight_attendance,
            final_score = excluded.final_score,
            grade = excluded.grade,
            manually_adjusted = excluded.manually_adjusted,
            version = excluded.version,
            etag = excluded.etag,
            computed_at = excluded.computed_at",
        rusqlite::params![
            id,
            key.student_id,
            key.class_id,
            key.subject,
            key.term,
            key.academic_year,
            pending.values.assessment_average,
            pending.values.assignment_average,
            pending.values.attendance_percentage,
            pending.weights.assessment,
            pending.weights.assignment,
            pending.weights.attendance,
            pending.values.final_score,
            pending.values.grade,
            adjusted_json,
            version,
            etag,
            now,
        ],
    )?;
    audit::append(&tx, actor, action, key, &pending.details, &now)?;
    tx.commit()?;

    Ok(Some(CarryMarkRecord {
        id,
        key: key.clone(),
        values: pending.values,
        weights: pending.weights,
        manually_adjusted_fields: pending.adjusted,
        computed_at: now,
        version,
        etag,
    }))
}

/// Extract, reduce and upsert one key.
pub fn recompute(
    conn: &mut Connection,
    key: &NaturalKey,
    policy: &ScoringPolicy,
    opts: WriteOptions<'_>,
) -> Result<RecomputeOutcome, EngineError> {
    policy.validate()?;
    // Extraction reads outside the write transaction; it is a best-effort
    // snapshot of the record stores.
    let components =
        calc::extract_components(&SqliteRecordSource::new(conn), key, policy.missing_components)?;
    store_recomputed(conn, key, &components, policy, opts)
}

/// Reduce already-extracted components and upsert the result.
pub fn store_recomputed(
    conn: &mut Connection,
    key: &NaturalKey,
    components: &Components,
    policy: &ScoringPolicy,
    opts: WriteOptions<'_>,
) -> Result<RecomputeOutcome, EngineError> {
    let reduction = calc::reduce(components, policy)?;
    let fresh = CarryValues::from_computation(components, reduction.as_ref());
    let no_data = components.is_empty();

    let written = upsert_with(conn, key, AuditAction::Recompute, opts, |prior| {
        let Some(prior) = prior else {
            if no_data {
                return Ok(None);
            }
            return Ok(Some(PendingWrite {
                values: fresh.clone(),
                weights: policy.weights,
                adjusted: BTreeSet::new(),
                details: json!({ "components": components, "computed": fresh }),
            }));
        };
        let values = prior
            .values
            .merged_with(&fresh, &prior.manually_adjusted_fields);
        Ok(Some(PendingWrite {
            values,
            weights: policy.weights,
            adjusted: prior.manually_adjusted_fields.clone(),
            details: json!({
                "components": components,
                "computed": fresh,
                "preserved": prior.manually_adjusted_fields,
            }),
        }))
    })?;

    match written {
        Some(record) => {
            tracing::info!(
                student_id = %key.student_id,
                class_id = %key.class_id,
                subject = %key.subject,
                term = %key.term,
                academic_year = %key.academic_year,
                final_score = ?record.values.final_score,
                version = record.version,
                "carry mark recomputed"
            );
            Ok(RecomputeOutcome::Computed { record })
        }
        None => {
            tracing::debug!(
                student_id = %key.student_id,
                subject = %key.subject,
                "no data for carry mark; nothing written"
            );
            Ok(RecomputeOutcome::NoData)
        }
    }
}

fn validate_patch(patch: &AdjustPatch) -> Result<(), String> {
    if patch.fields().is_empty() {
        return Err("fields must set at least one of: assessmentAverage, assignmentAverage, attendancePercentage, finalScore, grade".into());
    }
    for (field, v) in [
        (CarryField::AssessmentAverage, patch.assessment_average),
        (CarryField::AssignmentAverage, patch.assignment_average),
        (CarryField::AttendancePercentage, patch.attendance_percentage),
        (CarryField::FinalScore, patch.final_score),
    ] {
        if let Some(v) = v {
            if !v.is_finite() || !(0.0..=100.0).contains(&v) {
                return Err(format!("{} must be between 0 and 100", field.as_str()));
            }
        }
    }
    if let Some(g) = &patch.grade {
        if g.trim().is_empty() {
            return Err("grade must not be empty".into());
        }
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum AdjustError {
    #[error("{0}")]
    BadPatch(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Write caller-supplied values verbatim and mark them as manually adjusted.
/// Never re-runs the reducer. With `create == false` a missing record is
/// `NotFound` instead of being created.
pub fn adjust(
    conn: &mut Connection,
    key: &NaturalKey,
    patch: &AdjustPatch,
    create: bool,
    default_weights: Weights,
    opts: WriteOptions<'_>,
) -> Result<CarryMarkRecord, AdjustError> {
    validate_patch(patch).map_err(AdjustError::BadPatch)?;
    let touched = patch.fields();

    let written = upsert_with(conn, key, AuditAction::Adjust, opts, |prior| {
        let (mut values, weights, mut adjusted) = match prior {
            Some(p) => (
                p.values.clone(),
                p.weights,
                p.manually_adjusted_fields.clone(),
            ),
            None if create => (CarryValues::default(), default_weights, BTreeSet::new()),
            None => return Err(EngineError::NotFound),
        };
        let before = values.clone();
        patch.apply_to(&mut values);
        adjusted.extend(touched.iter().copied());
        Ok(Some(PendingWrite {
            details: json!({ "fields": touched, "before": before, "after": values }),
            values,
            weights,
            adjusted,
        }))
    })?;

    // The merge closure always writes or errors.
    let record = written.ok_or(EngineError::NotFound)?;
    tracing::info!(
        student_id = %key.student_id,
        subject = %key.subject,
        fields = ?touched,
        version = record.version,
        "carry mark adjusted"
    );
    Ok(record)
}

/// Hand fields back to recompute. `None` releases every adjusted field.
pub fn release_adjustments(
    conn: &mut Connection,
    key: &NaturalKey,
    fields: Option<&BTreeSet<CarryField>>,
    opts: WriteOptions<'_>,
) -> Result<CarryMarkRecord, EngineError> {
    let written = upsert_with(conn, key, AuditAction::Release, opts, |prior| {
        let Some(prior) = prior else {
            return Err(EngineError::NotFound);
        };
        let released: BTreeSet<CarryField> = match fields {
            Some(f) => prior
                .manually_adjusted_fields
                .intersection(f)
                .copied()
                .collect(),
            None => prior.manually_adjusted_fields.clone(),
        };
        let adjusted = prior
            .manually_adjusted_fields
            .difference(&released)
            .copied()
            .collect();
        Ok(Some(PendingWrite {
            values: prior.values.clone(),
            weights: prior.weights,
            adjusted,
            details: json!({ "released": released }),
        }))
    })?;
    written.ok_or(EngineError::NotFound)
}

/// Recompute every student in a class. Each student is its own atomic
/// upsert; the first engine failure stops the batch.
pub fn recompute_class(
    conn: &mut Connection,
    class_id: &str,
    subject: &str,
    term: &str,
    academic_year: &str,
    policy: &ScoringPolicy,
    opts: WriteOptions<'_>,
) -> Result<ClassRecompute, EngineError> {
    policy.validate()?;
    let student_ids: Vec<String> = {
        let mut stmt = conn
            .prepare("SELECT id FROM students WHERE class_id = ? AND active = 1 ORDER BY name, id")
            .map_err(|e| EngineError::unavailable("students", e))?;
        let rows = stmt
            .query_map([class_id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        rows.map_err(|e| EngineError::unavailable("students", e))?
    };

    let mut out = ClassRecompute {
        computed: Vec::new(),
        no_data: Vec::new(),
    };
    for student_id in student_ids {
        let key = NaturalKey {
            student_id,
            class_id: class_id.to_string(),
            subject: subject.to_string(),
            term: term.to_string(),
            academic_year: academic_year.to_string(),
        };
        match recompute(conn, &key, policy, opts)? {
            RecomputeOutcome::Computed { record } => out.computed.push(record),
            RecomputeOutcome::NoData => out.no_data.push(key.student_id),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn key() -> NaturalKey {
        NaturalKey {
            student_id: "s1".into(),
            class_id: "c1".into(),
            subject: "Math".into(),
            term: "1".into(),
            academic_year: "2024".into(),
        }
    }

    fn opts() -> WriteOptions<'static> {
        WriteOptions {
            actor: Some("cikgu.aminah"),
            max_attempts: 5,
        }
    }

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        db::create_schema(&conn).expect("schema");
        conn
    }

    fn components(a: Option<f64>, s: Option<f64>, att: f64, days: usize) -> Components {
        Components {
            assessment_average: a,
            assignment_average: s,
            attendance_percentage: att,
            attendance_entries: days,
        }
    }

    fn computed(outcome: RecomputeOutcome) -> CarryMarkRecord {
        match outcome {
            RecomputeOutcome::Computed { record } => record,
            RecomputeOutcome::NoData => panic!("expected a computed record"),
        }
    }

    fn count_rows(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM carry_marks", [], |r| r.get(0))
            .expect("count")
    }

    #[test]
    fn no_data_writes_nothing() {
        let mut conn = memory_db();
        let out = store_recomputed(
            &mut conn,
            &key(),
            &components(None, None, 0.0, 0),
            &ScoringPolicy::default(),
            opts(),
        )
        .expect("recompute");
        assert_eq!(out, RecomputeOutcome::NoData);
        assert_eq!(count_rows(&conn), 0);
    }

    #[test]
    fn unweighted_components_store_a_record_without_a_score() {
        let mut conn = memory_db();
        let policy = ScoringPolicy {
            weights: Weights {
                assessment: 100.0,
                assignment: 0.0,
                attendance: 0.0,
            },
            ..ScoringPolicy::default()
        };
        let rec = computed(
            store_recomputed(
                &mut conn,
                &key(),
                &components(None, Some(95.0), 100.0, 20),
                &policy,
                opts(),
            )
            .expect("recompute"),
        );
        assert_eq!(rec.values.assignment_average, Some(95.0));
        assert_eq!(rec.values.final_score, None);
        assert_eq!(rec.values.grade, None);
        assert_eq!(count_rows(&conn), 1);
    }

    #[test]
    fn class_recompute_skips_inactive_students() {
        let mut conn = memory_db();
        conn.execute_batch(
            "INSERT INTO classes(id, name, created_at) VALUES ('c1', '5 Amanah', 'now');
             INSERT INTO students(id, class_id, name, active, created_at)
               VALUES ('s1', 'c1', 'Aisyah', 1, 'now'),
                      ('s2', 'c1', 'Farid', 0, 'now');
             INSERT INTO attendance(id, student_id, class_id, date, status, term, academic_year, updated_at)
               VALUES ('d1', 's1', 'c1', '2024-01-02', 'present', '1', '2024', 'now'),
                      ('d2', 's2', 'c1', '2024-01-02', 'present', '1', '2024', 'now');",
        )
        .expect("seed");

        let out = recompute_class(
            &mut conn,
            "c1",
            "Math",
            "1",
            "2024",
            &ScoringPolicy::default(),
            opts(),
        )
        .expect("class recompute");
        let ids: Vec<&str> = out
            .computed
            .iter()
            .map(|r| r.key.student_id.as_str())
            .collect();
        assert_eq!(ids, vec!["s1"]);
        assert!(out.no_data.is_empty());
        assert_eq!(count_rows(&conn), 1);
    }

    #[test]
    fn recompute_is_idempotent_apart_from_timestamp() {
        let mut conn = memory_db();
        let c = components(Some(85.0), None, 90.0, 20);
        let policy = ScoringPolicy::default();
        let first = computed(store_recomputed(&mut conn, &key(), &c, &policy, opts()).expect("1"));
        let second =
            computed(store_recomputed(&mut conn, &key(), &c, &policy, opts()).expect("2"));
        assert_eq!(first.values, second.values);
        assert_eq!(first.etag, second.etag);
        assert_eq!(first.id, second.id);
        assert_eq!(second.version, first.version + 1);
        assert_eq!(first.values.final_score, Some(85.63));
        assert_eq!(count_rows(&conn), 1);
    }

    #[test]
    fn adjusted_final_score_survives_recompute() {
        let mut conn = memory_db();
        let policy = ScoringPolicy::default();
        let c = components(Some(60.0), Some(60.0), 60.0, 10);
        let first = computed(store_recomputed(&mut conn, &key(), &c, &policy, opts()).expect("1"));
        assert_eq!(first.values.final_score, Some(60.0));

        let adjusted = adjust(
            &mut conn,
            &key(),
            &AdjustPatch {
                final_score: Some(65.0),
                ..AdjustPatch::default()
            },
            true,
            policy.weights,
            opts(),
        )
        .expect("adjust");
        assert_eq!(adjusted.values.final_score, Some(65.0));
        assert!(adjusted
            .manually_adjusted_fields
            .contains(&CarryField::FinalScore));
        // Grade is untouched by adjust, even though it no longer matches.
        assert_eq!(adjusted.values.grade.as_deref(), Some("C"));

        let again = computed(store_recomputed(&mut conn, &key(), &c, &policy, opts()).expect("2"));
        assert_eq!(again.values.final_score, Some(65.0));
        assert_eq!(again.values.grade.as_deref(), Some("C"));
        assert_eq!(
            again.manually_adjusted_fields,
            BTreeSet::from([CarryField::FinalScore])
        );
    }

    #[test]
    fn adjust_creates_sparse_record_or_refuses() {
        let mut conn = memory_db();
        let patch = AdjustPatch {
            grade: Some("B+".into()),
            ..AdjustPatch::default()
        };
        let err = adjust(
            &mut conn,
            &key(),
            &patch,
            false,
            Weights::default(),
            opts(),
        )
        .expect_err("no record");
        assert!(matches!(err, AdjustError::Engine(EngineError::NotFound)));
        assert_eq!(count_rows(&conn), 0);

        let rec = adjust(&mut conn, &key(), &patch, true, Weights::default(), opts())
            .expect("create");
        assert_eq!(rec.values.grade.as_deref(), Some("B+"));
        assert_eq!(rec.values.final_score, None);
        assert_eq!(rec.values.assessment_average, None);
        assert_eq!(rec.version, 1);
    }

    #[test]
    fn adjust_rejects_out_of_range_and_empty_patches() {
        let mut conn = memory_db();
        let bad = AdjustPatch {
            final_score: Some(101.0),
            ..AdjustPatch::default()
        };
        assert!(matches!(
            adjust(&mut conn, &key(), &bad, true, Weights::default(), opts()),
            Err(AdjustError::BadPatch(_))
        ));
        assert!(matches!(
            adjust(
                &mut conn,
                &key(),
                &AdjustPatch::default(),
                true,
                Weights::default(),
                opts()
            ),
            Err(AdjustError::BadPatch(_))
        ));
    }

    #[test]
    fn release_hands_fields_back_to_recompute() {
        let mut conn = memory_db();
        let policy = ScoringPolicy::default();
        let c = components(Some(60.0), Some(60.0), 60.0, 10);
        store_recomputed(&mut conn, &key(), &c, &policy, opts()).expect("1");
        adjust(
            &mut conn,
            &key(),
            &AdjustPatch {
                final_score: Some(70.0),
                grade: Some("B".into()),
                ..AdjustPatch::default()
            },
            true,
            policy.weights,
            opts(),
        )
        .expect("adjust");

        let released = release_adjustments(
            &mut conn,
            &key(),
            Some(&BTreeSet::from([CarryField::FinalScore])),
            opts(),
        )
        .expect("release");
        assert_eq!(
            released.manually_adjusted_fields,
            BTreeSet::from([CarryField::Grade])
        );
        assert_eq!(released.values.final_score, Some(70.0));

        let again = computed(store_recomputed(&mut conn, &key(), &c, &policy, opts()).expect("2"));
        assert_eq!(again.values.final_score, Some(60.0));
        assert_eq!(again.values.grade.as_deref(), Some("B"));
    }

    #[test]
    fn data_disappearing_clears_computed_fields_but_keeps_record() {
        let mut conn = memory_db();
        let policy = ScoringPolicy::default();
        store_recomputed(
            &mut conn,
            &key(),
            &components(Some(50.0), None, 100.0, 4),
            &policy,
            opts(),
        )
        .expect("1");
        let rec = computed(
            store_recomputed(
                &mut conn,
                &key(),
                &components(None, None, 0.0, 0),
                &policy,
                opts(),
            )
            .expect("2"),
        );
        assert_eq!(rec.values.final_score, None);
        assert_eq!(rec.values.attendance_percentage, Some(0.0));
        assert_eq!(count_rows(&conn), 1);
    }

    #[test]
    fn writes_are_audited_in_the_same_transaction() {
        let mut conn = memory_db();
        let policy = ScoringPolicy::default();
        store_recomputed(
            &mut conn,
            &key(),
            &components(Some(50.0), None, 100.0, 4),
            &policy,
            opts(),
        )
        .expect("recompute");
        let rejected = adjust(
            &mut conn,
            &key(),
            &AdjustPatch::default(),
            true,
            policy.weights,
            opts(),
        );
        assert!(matches!(rejected, Err(AdjustError::BadPatch(_))));
        let entries = audit::list(
            &conn,
            &audit::AuditFilter {
                student_id: Some("s1".into()),
                class_id: None,
                limit: 10,
            },
        )
        .expect("audit");
        assert_eq!(entries.len(), 1, "rejected adjust must not be audited");
        assert_eq!(entries[0].action, "recompute");
        assert_eq!(entries[0].actor.as_deref(), Some("cikgu.aminah"));
    }

    fn temp_db_path(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn concurrent_writers_never_duplicate_a_key() {
        let dir = temp_db_path("carrymark-concurrent");
        let conn = db::open_db(&dir, Duration::from_secs(5)).expect("open");
        drop(conn);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let dir = dir.clone();
                std::thread::spawn(move || {
                    let mut conn = db::open_db(&dir, Duration::from_secs(5)).expect("open");
                    let policy = ScoringPolicy::default();
                    let opts = WriteOptions {
                        actor: None,
                        max_attempts: 20,
                    };
                    for i in 0..25 {
                        if (t + i) % 3 == 0 {
                            adjust(
                                &mut conn,
                                &key(),
                                &AdjustPatch {
                                    grade: Some(format!("G{t}")),
                                    ..AdjustPatch::default()
                                },
                                true,
                                policy.weights,
                                opts,
                            )
                            .expect("adjust");
                        } else {
                            store_recomputed(
                                &mut conn,
                                &key(),
                                &components(Some(70.0), Some(80.0), 90.0, 5),
                                &policy,
                                opts,
                            )
                            .expect("recompute");
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread");
        }

        let conn = db::open_db(&dir, Duration::from_secs(5)).expect("open");
        assert_eq!(count_rows(&conn), 1);
        let rec = get(&conn, &key()).expect("get").expect("record");
        // 100 writes in total, each bumping the version exactly once.
        assert_eq!(rec.version, 100);
        assert!(rec.manually_adjusted_fields.contains(&CarryField::Grade));
        assert_eq!(rec.values.final_score, Some(74.0));
    }
}
