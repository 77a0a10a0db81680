//! Field-level checks run before any mutation leaves the process.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{FieldError, ValidationErrors};
use crate::model::{AttendanceDraft, ClubDataDraft, Draft, MatchDraft, PlayerDraft, TeamDraft};

pub const MAX_NAME_LENGTH: usize = 100;
pub const JERSEY_RANGE: (i32, i32) = (1, 99);
pub const AGE_RANGE: (i32, i32) = (15, 50);
pub const FOUNDED_RANGE: (i32, i32) = (1800, 2100);

/// Accepted position codes and long names, compared case-insensitively.
const POSITIONS: &[&str] = &[
    "GK", "CB", "LB", "RB", "LWB", "RWB", "CDM", "CM", "CAM", "LM", "RM", "LW", "RW", "CF", "ST",
    "GOALKEEPER", "DEFENDER", "MIDFIELDER", "FORWARD",
];

/// Whether a payload creates a row or patches one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Required fields must be present.
    Create,
    /// Only fields that are present are checked.
    Update,
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap())
}

/// Validate a draft, collecting every violation.
pub fn validate<D: Draft>(draft: &D, mode: ValidationMode) -> Result<(), ValidationErrors> {
    let errors = draft.validate(mode);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(errors))
    }
}

fn check_required_text(
    errors: &mut Vec<FieldError>,
    field: &str,
    value: Option<&str>,
    mode: ValidationMode,
) {
    match value {
        None if mode == ValidationMode::Create => {
            errors.push(FieldError::new(field, "is required"));
        }
        None => {}
        Some(v) if v.trim().is_empty() => {
            errors.push(FieldError::new(field, "must not be empty"));
        }
        Some(v) if v.chars().count() > MAX_NAME_LENGTH => {
            errors.push(FieldError::new(
                field,
                format!("must be at most {} characters", MAX_NAME_LENGTH),
            ));
        }
        Some(_) => {}
    }
}

fn check_range(errors: &mut Vec<FieldError>, field: &str, value: Option<i32>, range: (i32, i32)) {
    match value {
        Some(v) if !(range.0..=range.1).contains(&v) => {
            errors.push(FieldError::new(
                field,
                format!("must be between {} and {}", range.0, range.1),
            ));
        }
        _ => {}
    }
}

fn check_non_negative(errors: &mut Vec<FieldError>, field: &str, value: Option<i32>) {
    if value.is_some_and(|v| v < 0) {
        errors.push(FieldError::new(field, "must not be negative"));
    }
}

fn check_present<T>(
    errors: &mut Vec<FieldError>,
    field: &str,
    value: Option<&T>,
    mode: ValidationMode,
) {
    if mode == ValidationMode::Create && value.is_none() {
        errors.push(FieldError::new(field, "is required"));
    }
}

impl Draft for PlayerDraft {
    fn validate(&self, mode: ValidationMode) -> Vec<FieldError> {
        let mut errors = Vec::new();

        check_required_text(&mut errors, "name", self.name.as_deref(), mode);

        check_required_text(&mut errors, "position", self.position.as_deref(), mode);
        if let Some(position) = self.position.as_deref() {
            let code = position.trim().to_uppercase();
            if !code.is_empty() && !POSITIONS.contains(&code.as_str()) {
                errors.push(FieldError::new(
                    "position",
                    format!("unknown position '{}'", position),
                ));
            }
        }

        check_range(&mut errors, "jersey_number", self.jersey_number, JERSEY_RANGE);
        check_range(&mut errors, "age", self.age, AGE_RANGE);

        if let Some(email) = self.email.as_deref() {
            if !email.is_empty() && !email_regex().is_match(email) {
                errors.push(FieldError::new("email", "is not a valid email address"));
            }
        }

        errors
    }
}

impl Draft for TeamDraft {
    fn validate(&self, mode: ValidationMode) -> Vec<FieldError> {
        let mut errors = Vec::new();
        check_required_text(&mut errors, "name", self.name.as_deref(), mode);
        check_range(&mut errors, "founded", self.founded, FOUNDED_RANGE);
        errors
    }
}

impl Draft for MatchDraft {
    fn validate(&self, mode: ValidationMode) -> Vec<FieldError> {
        let mut errors = Vec::new();
        check_required_text(&mut errors, "opponent", self.opponent.as_deref(), mode);
        check_present(&mut errors, "date", self.date.as_ref(), mode);
        check_non_negative(&mut errors, "goals_for", self.goals_for);
        check_non_negative(&mut errors, "goals_against", self.goals_against);
        errors
    }
}

impl Draft for ClubDataDraft {
    fn validate(&self, mode: ValidationMode) -> Vec<FieldError> {
        let mut errors = Vec::new();
        check_required_text(&mut errors, "name", self.name.as_deref(), mode);
        check_range(&mut errors, "founded", self.founded, FOUNDED_RANGE);
        errors
    }
}

impl Draft for AttendanceDraft {
    fn validate(&self, mode: ValidationMode) -> Vec<FieldError> {
        let mut errors = Vec::new();
        check_required_text(&mut errors, "player_id", self.player_id.as_deref(), mode);
        check_present(&mut errors, "session_date", self.session_date.as_ref(), mode);
        errors
    }
}
