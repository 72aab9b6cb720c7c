use crate::calc::ScoringPolicy;
use crate::db;
use crate::error::EngineError;
use rusqlite::Connection;
use serde_json::{Map, Value};

pub const SETTINGS_KEY: &str = "scoring.policy";

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("{0}")]
    BadPatch(String),
    #[error(transparent)]
    Invalid(#[from] EngineError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl PolicyError {
    pub fn code(&self) -> &'static str {
        match self {
            PolicyError::BadPatch(_) => "bad_params",
            PolicyError::Invalid(e) => e.code(),
            PolicyError::Storage(_) => "db_query_failed",
        }
    }

    /// The stored value itself is unusable, as opposed to the read failing.
    pub fn is_corrupt_policy(&self) -> bool {
        !matches!(self, PolicyError::Storage(_))
    }
}

/// Stored policy merged over the defaults. A stored value that is not an
/// object or does not validate is an error; scoring never runs on a policy
/// the workspace did not ask for.
pub fn load(conn: &Connection) -> Result<ScoringPolicy, PolicyError> {
    let Some(saved) = db::settings_get_json(conn, SETTINGS_KEY)? else {
        return Ok(ScoringPolicy::default());
    };
    let Some(obj) = saved.as_object() else {
        return Err(PolicyError::BadPatch(
            "stored scoring policy must be an object".into(),
        ));
    };
    apply_patch(&ScoringPolicy::default(), obj)
}

pub fn save(conn: &Connection, policy: &ScoringPolicy) -> anyhow::Result<()> {
    db::settings_set_json(conn, SETTINGS_KEY, &serde_json::to_value(policy)?)
}

/// Shallow merge of a camelCase patch over `current`, then full validation.
/// `weights` merges per field so a caller can move weight between two
/// components without restating the third.
pub fn apply_patch(
    current: &ScoringPolicy,
    patch: &Map<String, Value>,
) -> Result<ScoringPolicy, PolicyError> {
    let mut merged = serde_json::to_value(current)
        .map_err(|e| PolicyError::BadPatch(e.to_string()))?;
    let obj = merged
        .as_object_mut()
        .ok_or_else(|| PolicyError::BadPatch("policy must be an object".into()))?;

    for (k, v) in patch {
        match k.as_str() {
            "weights" => {
                let Some(w_patch) = v.as_object() else {
                    return Err(PolicyError::BadPatch("weights must be an object".into()));
                };
                let w = obj
                    .entry("weights")
                    .or_insert_with(|| Value::Object(Map::new()));
                let Some(w_obj) = w.as_object_mut() else {
                    return Err(PolicyError::BadPatch("weights must be an object".into()));
                };
                for (wk, wv) in w_patch {
                    if !matches!(wk.as_str(), "assessment" | "assignment" | "attendance") {
                        return Err(PolicyError::BadPatch(format!("unknown weight: {}", wk)));
                    }
                    if !wv.is_number() {
                        return Err(PolicyError::BadPatch(format!(
                            "weights.{} must be a number",
                            wk
                        )));
                    }
                    w_obj.insert(wk.clone(), wv.clone());
                }
            }
            "gradeBands" => {
                if !v.is_array() {
                    return Err(PolicyError::BadPatch("gradeBands must be an array".into()));
                }
                obj.insert(k.clone(), v.clone());
            }
            "missingComponents" => {
                let s = v.as_str().unwrap_or_default();
                if s != "exclude" && s != "zeroFill" {
                    return Err(PolicyError::BadPatch(
                        "missingComponents must be one of: exclude, zeroFill".into(),
                    ));
                }
                obj.insert(k.clone(), v.clone());
            }
            "maxUpsertAttempts" => {
                let n = v.as_u64().unwrap_or(0);
                if !(1..=20).contains(&n) {
                    return Err(PolicyError::BadPatch(
                        "maxUpsertAttempts must be in 1..=20".into(),
                    ));
                }
                obj.insert(k.clone(), v.clone());
            }
            _ => return Err(PolicyError::BadPatch(format!("unknown policy field: {}", k))),
        }
    }

    let policy: ScoringPolicy =
        serde_json::from_value(merged).map_err(|e| PolicyError::BadPatch(e.to_string()))?;
    policy.validate()?;
    Ok(policy)
}
