use crate::calc::{
    AssessmentScore, AssessmentType, AssignmentSubmission, AttendanceEntry, AttendanceStatus,
    NaturalKey,
};
use crate::error::EngineError;
use rusqlite::Connection;

/// Read-only queries the extractors run against the record stores.
pub trait RecordSource {
    fn list_assessments(&self, key: &NaturalKey) -> Result<Vec<AssessmentScore>, EngineError>;
    fn list_submissions(&self, key: &NaturalKey)
        -> Result<Vec<AssignmentSubmission>, EngineError>;
    fn list_attendance(&self, key: &NaturalKey) -> Result<Vec<AttendanceEntry>, EngineError>;
}

pub struct SqliteRecordSource<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteRecordSource<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl RecordSource for SqliteRecordSource<'_> {
    fn list_assessments(&self, key: &NaturalKey) -> Result<Vec<AssessmentScore>, EngineError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT assessment_type, raw_score, max_score
                 FROM assessments
                 WHERE student_id = ? AND class_id = ? AND subject = ?
                   AND term = ? AND academic_year = ?
                 ORDER BY assessment_type",
            )
            .map_err(|e| EngineError::unavailable("assessments", e))?;
        let rows = stmt
            .query_map(
                (
                    &key.student_id,
                    &key.class_id,
                    &key.subject,
                    &key.term,
                    &key.academic_year,
                ),
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, f64>(1)?,
                        r.get::<_, f64>(2)?,
                    ))
                },
            )
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| EngineError::unavailable("assessments", e))?;

        rows.into_iter()
            .map(|(ty, raw_score, max_score)| {
                let assessment_type = AssessmentType::parse(&ty).ok_or_else(|| {
                    EngineError::DataUnavailable(format!("unknown assessment type in store: {ty}"))
                })?;
                Ok(AssessmentScore {
                    student_id: key.student_id.clone(),
                    class_id: key.class_id.clone(),
                    subject: key.subject.clone(),
                    assessment_type,
                    raw_score,
                    max_score,
                    term: key.term.clone(),
                    academic_year: key.academic_year.clone(),
                })
            })
            .collect()
    }

    fn list_submissions(
        &self,
        key: &NaturalKey,
    ) -> Result<Vec<AssignmentSubmission>, EngineError> {
        // Max score is inherited from the parent assignment; retired
        // assignments no longer contribute.
        let mut stmt = self
            .conn
            .prepare(
                "SELECT a.id, s.raw_score, a.max_score
                 FROM submissions s
                 JOIN assignments a ON a.id = s.assignment_id
                 WHERE s.student_id = ? AND a.class_id = ? AND a.subject = ?
                   AND a.term = ? AND a.academic_year = ? AND a.active = 1
                 ORDER BY a.created_at, a.id",
            )
            .map_err(|e| EngineError::unavailable("submissions", e))?;
        stmt.query_map(
            (
                &key.student_id,
                &key.class_id,
                &key.subject,
                &key.term,
                &key.academic_year,
            ),
            |r| {
                Ok(AssignmentSubmission {
                    assignment_id: r.get(0)?,
                    student_id: key.student_id.clone(),
                    raw_score: r.get(1)?,
                    max_score: r.get(2)?,
                    term: key.term.clone(),
                    academic_year: key.academic_year.clone(),
                })
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| EngineError::unavailable("submissions", e))
    }

    fn list_attendance(&self, key: &NaturalKey) -> Result<Vec<AttendanceEntry>, EngineError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT date, status
                 FROM attendance
                 WHERE student_id = ? AND class_id = ? AND term = ? AND academic_year = ?
                 ORDER BY date",
            )
            .map_err(|e| EngineError::unavailable("attendance", e))?;
        let rows = stmt
            .query_map(
                (&key.student_id, &key.class_id, &key.term, &key.academic_year),
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
            )
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| EngineError::unavailable("attendance", e))?;

        rows.into_iter()
            .map(|(date, status)| {
                let status = AttendanceStatus::parse(&status).ok_or_else(|| {
                    EngineError::DataUnavailable(format!(
                        "unknown attendance status in store: {status}"
                    ))
                })?;
                Ok(AttendanceEntry {
                    student_id: key.student_id.clone(),
                    class_id: key.class_id.clone(),
                    date,
                    status,
                    term: key.term.clone(),
                    academic_year: key.academic_year.clone(),
                })
            })
            .collect()
    }
}
