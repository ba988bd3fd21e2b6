//! Common types used across the reconciliation workspace

use serde::{Deserialize, Serialize};

use crate::error::ReconError;

/// Category of record being reconciled
///
/// The set is closed: every entity type has a local table, a CRM object and a
/// declared schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Volunteer,
    Organization,
    Event,
    Student,
    Teacher,
}

impl EntityType {
    /// All entity types, in their canonical order
    pub const ALL: [EntityType; 5] = [
        EntityType::Volunteer,
        EntityType::Organization,
        EntityType::Event,
        EntityType::Student,
        EntityType::Teacher,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Volunteer => "volunteer",
            EntityType::Organization => "organization",
            EntityType::Event => "event",
            EntityType::Student => "student",
            EntityType::Teacher => "teacher",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = ReconError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "volunteer" | "volunteers" => Ok(EntityType::Volunteer),
            "organization" | "organizations" => Ok(EntityType::Organization),
            "event" | "events" => Ok(EntityType::Event),
            "student" | "students" => Ok(EntityType::Student),
            "teacher" | "teachers" => Ok(EntityType::Teacher),
            other => Err(ReconError::UnknownEntityType(other.to_string())),
        }
    }
}

/// Kind of comparison performed by a validator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    Schema,
    Count,
    Completeness,
    Hash,
    Tolerance,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::Schema => "schema",
            CheckType::Count => "count",
            CheckType::Completeness => "completeness",
            CheckType::Hash => "hash",
            CheckType::Tolerance => "tolerance",
        }
    }

    /// Whether this check only runs in slow mode
    pub fn is_slow(&self) -> bool {
        matches!(self, CheckType::Hash | CheckType::Tolerance)
    }
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CheckType {
    type Err = ReconError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "schema" => Ok(CheckType::Schema),
            "count" => Ok(CheckType::Count),
            "completeness" => Ok(CheckType::Completeness),
            "hash" => Ok(CheckType::Hash),
            "tolerance" => Ok(CheckType::Tolerance),
            other => Err(ReconError::UnknownCheckType(other.to_string())),
        }
    }
}

/// Severity of a recorded discrepancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Blocking,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Blocking => "blocking",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = ReconError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "blocking" | "block" => Ok(Severity::Blocking),
            other => Err(ReconError::UnknownSeverity(other.to_string())),
        }
    }
}

/// Depth of a reconciliation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Counts, completeness and schema drift
    #[default]
    Fast,
    /// Fast checks plus hash diffing and tolerance comparison
    Slow,
}

impl ValidationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationMode::Fast => "fast",
            ValidationMode::Slow => "slow",
        }
    }

    /// Checks executed by this mode, in execution order
    pub fn checks(&self) -> &'static [CheckType] {
        match self {
            ValidationMode::Fast => &[CheckType::Schema, CheckType::Count, CheckType::Completeness],
            ValidationMode::Slow => &[
                CheckType::Schema,
                CheckType::Count,
                CheckType::Completeness,
                CheckType::Hash,
                CheckType::Tolerance,
            ],
        }
    }
}

impl std::fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ValidationMode {
    type Err = ReconError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fast" => Ok(ValidationMode::Fast),
            "slow" | "full" => Ok(ValidationMode::Slow),
            other => Err(ReconError::UnknownMode(other.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_round_trip() {
        for entity in EntityType::ALL {
            assert_eq!(entity.as_str().parse::<EntityType>().unwrap(), entity);
        }
        assert_eq!("Events".parse::<EntityType>().unwrap(), EntityType::Event);
        assert!("donor".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_slow_mode_is_superset_of_fast() {
        let slow = ValidationMode::Slow.checks();
        for check in ValidationMode::Fast.checks() {
            assert!(slow.contains(check));
        }
        assert!(ValidationMode::Fast.checks().iter().all(|c| !c.is_slow()));
    }

    #[test]
    fn test_schema_runs_first() {
        assert_eq!(ValidationMode::Fast.checks()[0], CheckType::Schema);
        assert_eq!(ValidationMode::Slow.checks()[0], CheckType::Schema);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Blocking > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
        assert_eq!("warn".parse::<Severity>().unwrap(), Severity::Warning);
    }
}
