//! Calibration thresholds consumed by the ingestion gate
//!
//! SQL reference: `/sql/01_calibration_thresholds.sql`
//!
//! Thresholds are per category (industry type). Most parameters have a
//! single ceiling; pH-like parameters carry a two-sided band and exceed when
//! the value reaches either the upper or the lower limit.

use super::types::SubEntityReading;
use crate::store::StoreError;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ThresholdRule {
    Ceiling { limit: f64 },
    TwoSided { above: f64, below: f64 },
}

impl ThresholdRule {
    pub fn is_exceeded(&self, value: f64) -> bool {
        match *self {
            ThresholdRule::Ceiling { limit } => value >= limit,
            ThresholdRule::TwoSided { above, below } => value >= above || value <= below,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceededParameter {
    pub sub_entity: String,
    pub parameter: String,
    pub value: f64,
    pub rule: ThresholdRule,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationProfile {
    pub category: String,
    pub thresholds: HashMap<String, ThresholdRule>,
}

impl CalibrationProfile {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            thresholds: HashMap::new(),
        }
    }

    pub fn with_rule(mut self, parameter: impl Into<String>, rule: ThresholdRule) -> Self {
        self.thresholds.insert(parameter.into(), rule);
        self
    }

    /// Parameters of one sub-entity that cross their limit
    pub fn exceeded(&self, sub: &SubEntityReading) -> Vec<ExceededParameter> {
        sub.parameters
            .iter()
            .filter_map(|(name, value)| {
                let rule = self.thresholds.get(name)?;
                let value = value.as_number()?;
                rule.is_exceeded(value).then(|| ExceededParameter {
                    sub_entity: sub.name.clone(),
                    parameter: name.clone(),
                    value,
                    rule: *rule,
                })
            })
            .collect()
    }
}

#[async_trait]
pub trait CalibrationProvider: Send + Sync {
    /// Thresholds for a category; `Ok(None)` when the category has none
    async fn profile(&self, category: &str) -> Result<Option<CalibrationProfile>, StoreError>;
}

/// Fixed in-memory profiles
#[derive(Debug, Clone, Default)]
pub struct StaticCalibration {
    profiles: HashMap<String, CalibrationProfile>,
}

impl StaticCalibration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, profile: CalibrationProfile) -> Self {
        self.profiles.insert(profile.category.clone(), profile);
        self
    }
}

#[async_trait]
impl CalibrationProvider for StaticCalibration {
    async fn profile(&self, category: &str) -> Result<Option<CalibrationProfile>, StoreError> {
        Ok(self.profiles.get(category).cloned())
    }
}

/// Profiles read from the `calibration_thresholds` table
pub struct SqliteCalibration {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCalibration {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("calibration connection lock poisoned".to_string()))
    }

    /// Insert or replace one parameter limit
    ///
    /// Operation: UPSERT (INSERT ... ON CONFLICT(category, parameter) DO UPDATE)
    pub fn upsert_rule(
        &self,
        category: &str,
        parameter: &str,
        rule: ThresholdRule,
        now: i64,
    ) -> Result<(), StoreError> {
        let (ceiling, above, below) = match rule {
            ThresholdRule::Ceiling { limit } => (Some(limit), None, None),
            ThresholdRule::TwoSided { above, below } => (None, Some(above), Some(below)),
        };

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO calibration_thresholds (category, parameter, ceiling, above, below, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(category, parameter) DO UPDATE SET
                ceiling = excluded.ceiling,
                above = excluded.above,
                below = excluded.below,
                updated_at = excluded.updated_at
            "#,
            params![category, parameter, ceiling, above, below, now],
        )?;
        Ok(())
    }
}

#[async_trait]
impl CalibrationProvider for SqliteCalibration {
    async fn profile(&self, category: &str) -> Result<Option<CalibrationProfile>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT parameter, ceiling, above, below FROM calibration_thresholds WHERE category = ?",
        )?;

        let rows = stmt
            .query_map(params![category], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut profile = CalibrationProfile::new(category);
        for (parameter, ceiling, above, below) in rows {
            let rule = match (ceiling, above, below) {
                (_, Some(above), Some(below)) => ThresholdRule::TwoSided { above, below },
                (Some(limit), _, _) => ThresholdRule::Ceiling { limit },
                _ => {
                    log::warn!(
                        "⚠️  Calibration row {}.{} has no usable limit, skipping",
                        category,
                        parameter
                    );
                    continue;
                }
            };
            profile.thresholds.insert(parameter, rule);
        }
        Ok(Some(profile))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::ParamValue;
    use crate::store::SqliteHotStore;
    use tempfile::NamedTempFile;

    fn make_sub(params: &[(&str, ParamValue)]) -> SubEntityReading {
        SubEntityReading {
            name: "STACK_1".to_string(),
            station_class: "quality".to_string(),
            parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn test_ceiling_is_inclusive() {
        let rule = ThresholdRule::Ceiling { limit: 50.0 };
        assert!(!rule.is_exceeded(49.99));
        assert!(rule.is_exceeded(50.0));
    }

    #[test]
    fn test_two_sided_rule() {
        let rule = ThresholdRule::TwoSided { above: 8.5, below: 6.5 };
        assert!(rule.is_exceeded(8.5));
        assert!(rule.is_exceeded(6.5));
        assert!(rule.is_exceeded(3.0));
        assert!(!rule.is_exceeded(7.2));
    }

    #[test]
    fn test_profile_reports_exceeded_parameters() {
        let profile = CalibrationProfile::new("Sugar")
            .with_rule("BOD", ThresholdRule::Ceiling { limit: 30.0 })
            .with_rule("pH", ThresholdRule::TwoSided { above: 8.5, below: 6.5 });

        let sub = make_sub(&[
            ("BOD", ParamValue::Number(31.0)),
            ("pH", ParamValue::Text("7.0".into())),
            ("TSS", ParamValue::Number(1000.0)),
        ]);

        let exceeded = profile.exceeded(&sub);
        assert_eq!(exceeded.len(), 1);
        assert_eq!(exceeded[0].parameter, "BOD");
        assert_eq!(exceeded[0].sub_entity, "STACK_1");
    }

    #[tokio::test]
    async fn test_sqlite_calibration_round_trip() {
        let file = NamedTempFile::new().unwrap();
        let hot = SqliteHotStore::open(file.path(), "sql").unwrap();
        let calibration = SqliteCalibration::new(hot.connection());

        calibration
            .upsert_rule("Sugar", "BOD", ThresholdRule::Ceiling { limit: 30.0 }, 1)
            .unwrap();
        calibration
            .upsert_rule("Sugar", "pH", ThresholdRule::TwoSided { above: 8.5, below: 6.5 }, 1)
            .unwrap();
        calibration
            .upsert_rule("Sugar", "BOD", ThresholdRule::Ceiling { limit: 25.0 }, 2)
            .unwrap();

        let profile = calibration.profile("Sugar").await.unwrap().unwrap();
        assert_eq!(profile.thresholds.len(), 2);
        assert_eq!(profile.thresholds["BOD"], ThresholdRule::Ceiling { limit: 25.0 });
        assert_eq!(
            profile.thresholds["pH"],
            ThresholdRule::TwoSided { above: 8.5, below: 6.5 }
        );

        assert!(calibration.profile("Distillery").await.unwrap().is_none());
    }
}
