use crate::error::EngineError;
use crate::store::RecordSource;
use serde::{Deserialize, Serialize};

const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;
const TIE_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NaturalKey {
    pub student_id: String,
    pub class_id: String,
    pub subject: String,
    pub term: String,
    pub academic_year: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssessmentType {
    US1,
    US2,
    UASA,
    US3,
    US4,
    UASA2,
}

impl AssessmentType {
    pub const ALL: [AssessmentType; 6] = [
        AssessmentType::US1,
        AssessmentType::US2,
        AssessmentType::UASA,
        AssessmentType::US3,
        AssessmentType::US4,
        AssessmentType::UASA2,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AssessmentType::US1 => "US1",
            AssessmentType::US2 => "US2",
            AssessmentType::UASA => "UASA",
            AssessmentType::US3 => "US3",
            AssessmentType::US4 => "US4",
            AssessmentType::UASA2 => "UASA2",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let t = s.trim();
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_str().eq_ignore_ascii_case(t))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Late => "late",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Some(AttendanceStatus::Present),
            "absent" => Some(AttendanceStatus::Absent),
            "late" => Some(AttendanceStatus::Late),
            _ => None,
        }
    }

    /// Late arrivals count toward presence.
    pub fn counts_as_present(self) -> bool {
        matches!(self, AttendanceStatus::Present | AttendanceStatus::Late)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentScore {
    pub student_id: String,
    pub class_id: String,
    pub subject: String,
    pub assessment_type: AssessmentType,
    pub raw_score: f64,
    pub max_score: f64,
    pub term: String,
    pub academic_year: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentSubmission {
    pub assignment_id: String,
    pub student_id: String,
    /// `None` means the student never submitted; that is not a zero.
    pub raw_score: Option<f64>,
    pub max_score: f64,
    pub term: String,
    pub academic_year: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceEntry {
    pub student_id: String,
    pub class_id: String,
    pub date: String,
    pub status: AttendanceStatus,
    pub term: String,
    pub academic_year: String,
}

/// How the engine treats a component with no contributing records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MissingComponents {
    /// Leave the component out and renormalize the remaining weights.
    #[default]
    Exclude,
    /// Count missing assessment types and a missing assignment average as 0.
    ZeroFill,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Weights {
    pub assessment: f64,
    pub assignment: f64,
    pub attendance: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            assessment: 70.0,
            assignment: 20.0,
            attendance: 10.0,
        }
    }
}

impl Weights {
    pub fn validate(&self) -> Result<(), EngineError> {
        for (name, w) in [
            ("assessment", self.assessment),
            ("assignment", self.assignment),
            ("attendance", self.attendance),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(EngineError::InvalidWeights(format!(
                    "{name} weight must be a non-negative number (got {w})"
                )));
            }
        }
        let sum = self.assessment + self.assignment + self.attendance;
        if (sum - 100.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(EngineError::InvalidWeights(format!(
                "weights must sum to 100 (got {sum})"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub label: String,
    /// Inclusive lower bound.
    pub min: f64,
    /// Exclusive upper bound, except a band ending at 100 also covers 100.
    pub max: f64,
}

impl GradeBand {
    fn covers(&self, score: f64) -> bool {
        score >= self.min && (score < self.max || (self.max >= 100.0 && score <= self.max))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GradeBands(pub Vec<GradeBand>);

impl Default for GradeBands {
    fn default() -> Self {
        let band = |label: &str, min: f64, max: f64| GradeBand {
            label: label.to_string(),
            min,
            max,
        };
        GradeBands(vec![
            band("A", 80.0, 100.0),
            band("B", 65.0, 80.0),
            band("C", 50.0, 65.0),
            band("D", 40.0, 50.0),
            band("E", 0.0, 40.0),
        ])
    }
}

impl GradeBands {
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut sorted: Vec<&GradeBand> = self.0.iter().collect();
        for b in &sorted {
            if b.label.trim().is_empty() {
                return Err(EngineError::InvalidGradeBands(
                    "band label must not be empty".into(),
                ));
            }
            if !b.min.is_finite() || !b.max.is_finite() {
                return Err(EngineError::InvalidGradeBands(format!(
                    "band {} has a non-numeric bound",
                    b.label
                )));
            }
            if b.min < 0.0 || b.max > 100.0 || b.min >= b.max {
                return Err(EngineError::InvalidGradeBands(format!(
                    "band {} must satisfy 0 <= min < max <= 100 (got [{}, {}))",
                    b.label, b.min, b.max
                )));
            }
        }
        sorted.sort_by(|a, b| a.min.total_cmp(&b.min));
        for pair in sorted.windows(2) {
            if pair[0].max > pair[1].min {
                return Err(EngineError::InvalidGradeBands(format!(
                    "bands {} and {} overlap",
                    pair[0].label, pair[1].label
                )));
            }
        }
        Ok(())
    }

    pub fn grade_for(&self, score: f64) -> Option<String> {
        self.0
            .iter()
            .find(|b| b.covers(score))
            .map(|b| b.label.clone())
    }
}

/// Everything the reducer needs besides the components themselves. Passed
/// explicitly so different subjects can run under different policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScoringPolicy {
    pub weights: Weights,
    pub grade_bands: GradeBands,
    pub missing_components: MissingComponents,
    pub max_upsert_attempts: u32,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            weights: Weights::default(),
            grade_bands: GradeBands::default(),
            missing_components: MissingComponents::Exclude,
            max_upsert_attempts: 5,
        }
    }
}

impl ScoringPolicy {
    pub fn validate(&self) -> Result<(), EngineError> {
        self.weights.validate()?;
        self.grade_bands.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub present: usize,
    pub late: usize,
    pub absent: usize,
    pub total: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Components {
    pub assessment_average: Option<f64>,
    pub assignment_average: Option<f64>,
    /// Never undefined: no entries reads as 0%.
    pub attendance_percentage: f64,
    pub attendance_entries: usize,
}

impl Components {
    /// True when none of the three streams contributed anything.
    pub fn is_empty(&self) -> bool {
        self.assessment_average.is_none()
            && self.assignment_average.is_none()
            && self.attendance_entries == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reduction {
    pub final_score: f64,
    pub grade: Option<String>,
}

fn normalized(raw: f64, max: f64, what: &str) -> Result<f64, EngineError> {
    if !raw.is_finite() || raw < 0.0 {
        return Err(EngineError::DataUnavailable(format!(
            "malformed {what}: score {raw} is not a non-negative number"
        )));
    }
    if !max.is_finite() || max <= 0.0 {
        return Err(EngineError::DataUnavailable(format!(
            "malformed {what}: max score {max} must be positive"
        )));
    }
    Ok(100.0 * raw / max)
}

fn clamp_percent(v: f64) -> f64 {
    v.clamp(0.0, 100.0)
}

pub fn assessment_average(
    scores: &[AssessmentScore],
    missing: MissingComponents,
) -> Result<Option<f64>, EngineError> {
    if scores.is_empty() {
        return Ok(None);
    }
    let mut sum = 0.0_f64;
    for s in scores {
        sum += normalized(s.raw_score, s.max_score, "assessment")?;
    }
    let denom = match missing {
        MissingComponents::Exclude => scores.len(),
        // Unrecorded types contribute 0 but still occupy a slot.
        MissingComponents::ZeroFill => AssessmentType::ALL.len().max(scores.len()),
    };
    Ok(Some(clamp_percent(sum / denom as f64)))
}

pub fn assignment_average(submissions: &[AssignmentSubmission]) -> Result<Option<f64>, EngineError> {
    let mut sum = 0.0_f64;
    let mut count = 0_usize;
    for s in submissions {
        let Some(raw) = s.raw_score else {
            continue;
        };
        sum += normalized(raw, s.max_score, "submission")?;
        count += 1;
    }
    if count == 0 {
        return Ok(None);
    }
    Ok(Some(clamp_percent(sum / count as f64)))
}

pub fn attendance_summary(entries: &[AttendanceEntry]) -> AttendanceSummary {
    let mut present = 0;
    let mut late = 0;
    let mut absent = 0;
    for e in entries {
        match e.status {
            AttendanceStatus::Present => present += 1,
            AttendanceStatus::Late => late += 1,
            AttendanceStatus::Absent => absent += 1,
        }
    }
    let total = entries.len();
    let attended = entries
        .iter()
        .filter(|e| e.status.counts_as_present())
        .count();
    let percentage = if total > 0 {
        100.0 * (attended as f64) / (total as f64)
    } else {
        0.0
    };
    AttendanceSummary {
        present,
        late,
        absent,
        total,
        percentage,
    }
}

pub fn attendance_percentage(entries: &[AttendanceEntry]) -> f64 {
    attendance_summary(entries).percentage
}

/// Runs the three extractors for one key. The first store failure aborts the
/// whole extraction; a partial set of components is never returned.
pub fn extract_components<S: RecordSource + ?Sized>(
    source: &S,
    key: &NaturalKey,
    missing: MissingComponents,
) -> Result<Components, EngineError> {
    let assessments = source.list_assessments(key)?;
    let submissions = source.list_submissions(key)?;
    let attendance = source.list_attendance(key)?;

    Ok(Components {
        assessment_average: assessment_average(&assessments, missing)?,
        assignment_average: assignment_average(&submissions)?,
        attendance_percentage: attendance_percentage(&attendance),
        attendance_entries: attendance.len(),
    })
}

/// Two-decimal rounding with ties going away from zero. Values that land
/// within `TIE_TOLERANCE` of a tie after scaling are treated as exact ties,
/// so `1.005` rounds to `1.01` despite its binary representation.
pub fn round_2dp(x: f64) -> f64 {
    let scaled = x * 100.0;
    let floor = scaled.floor();
    let snapped = if ((scaled - floor) - 0.5).abs() < TIE_TOLERANCE {
        floor + 0.5
    } else {
        scaled
    };
    snapped.round() / 100.0
}

/// Weighted composite of the components. Returns `Ok(None)` when no stream
/// contributed any data, or when every stream that did carries zero weight.
pub fn reduce(
    components: &Components,
    policy: &ScoringPolicy,
) -> Result<Option<Reduction>, EngineError> {
    policy.validate()?;
    if components.is_empty() {
        return Ok(None);
    }

    let (assessment, assignment) = match policy.missing_components {
        MissingComponents::Exclude => (
            components.assessment_average,
            components.assignment_average,
        ),
        MissingComponents::ZeroFill => (
            Some(components.assessment_average.unwrap_or(0.0)),
            Some(components.assignment_average.unwrap_or(0.0)),
        ),
    };

    let w = &policy.weights;
    let mut weighted_sum = 0.0_f64;
    let mut weight_total = 0.0_f64;
    for (value, weight) in [
        (assessment, w.assessment),
        (assignment, w.assignment),
        (Some(components.attendance_percentage), w.attendance),
    ] {
        if let Some(v) = value {
            weighted_sum += v * weight;
            weight_total += weight;
        }
    }

    if weight_total <= 0.0 {
        return Ok(None);
    }
    let final_score = round_2dp((weighted_sum / weight_total).clamp(0.0, 100.0));
    Ok(Some(Reduction {
        final_score,
        grade: policy.grade_bands.grade_for(final_score),
    }))
}
