use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use strum::IntoEnumIterator;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::field::{ExtractionResult, Field, FieldKind, FieldValue, RawFields, POSITIONS};
use crate::models::resume::UserId;
use crate::services::dates::{self, PositionSpan, ResumeDate};
use crate::services::taxonomy::{Snap, Taxonomy, Vocabulary};

/// Values the model uses to say "not found".
const NULL_SENTINELS: &[&str] = &["null", "n/a", "none", "unknown"];

/// Largest plausible number of years for any experience figure.
const MAX_YEARS: f64 = 70.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ViolationReason {
    #[error("not a recognisable date")]
    UnparseableDate,

    #[error("date lies after the processing date")]
    FutureDate,

    #[error("start date cannot be open-ended")]
    OpenEndedStart,

    #[error("not a number")]
    NotANumber,

    #[error("outside the plausible range of years")]
    OutOfRange,

    #[error("not a canonical term")]
    NotInVocabulary,

    #[error("longer than the {limit} character column")]
    Truncated { limit: usize },

    #[error("required value missing")]
    Missing,

    #[error("duplicates Phone1")]
    DuplicatePhone,

    #[error("not a valid {0}")]
    InvalidFormat(&'static str),
}

/// A field that failed its check. The field is nulled (or truncated) and the
/// rest of the record proceeds.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{field}: {reason} (value {value:?})")]
pub struct FieldViolation {
    pub field: Field,
    pub value: String,
    pub reason: ViolationReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Validated {
    pub result: ExtractionResult,
    pub violations: Vec<FieldViolation>,
}

impl Validated {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Date that open positions run to and that no extracted date may pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingDate {
    /// The current UTC date, read again for every record.
    Today,
    Fixed(NaiveDate),
    /// Open positions stay unresolved and future dates are not checked.
    Unknown,
}

impl ProcessingDate {
    pub fn resolve(self) -> Option<NaiveDate> {
        match self {
            ProcessingDate::Today => Some(Utc::now().date_naive()),
            ProcessingDate::Fixed(date) => Some(date),
            ProcessingDate::Unknown => None,
        }
    }
}

/// Type, format and vocabulary checks for raw model output.
#[derive(Debug, Clone)]
pub struct FieldValidator {
    taxonomy: Arc<Taxonomy>,
    processing_date: ProcessingDate,
}

impl FieldValidator {
    pub fn new(taxonomy: Arc<Taxonomy>, processing_date: ProcessingDate) -> Self {
        Self {
            taxonomy,
            processing_date,
        }
    }

    /// Validate every schema field independently. Never fails: problems are
    /// returned as violations alongside a complete result.
    pub fn validate(&self, user_id: UserId, raw: &RawFields) -> Validated {
        self.validate_on(user_id, raw, self.processing_date.resolve())
    }

    /// [`validate`](Self::validate) against an explicit processing date.
    pub fn validate_on(&self, user_id: UserId, raw: &RawFields, today: Option<NaiveDate>) -> Validated {
        let mut result = ExtractionResult::empty(user_id);
        let mut violations = Vec::new();

        for field in Field::iter() {
            let value = match raw.get(field).and_then(normalize_text) {
                Some(text) => self.check(field, text, today, &mut violations),
                None => {
                    if !field.nullable() {
                        violations.push(violation(field, "", ViolationReason::Missing));
                    }
                    FieldValue::Null
                }
            };
            result.set(field, value);
        }

        dedupe_phones(&mut result, &mut violations);
        self.reconcile_experience(raw, today, &mut result);

        for v in &violations {
            warn!(user_id = %user_id, field = %v.field, value = %v.value, reason = %v.reason, "Field violation");
            metrics::counter!("field_violations_total", "field" => v.field.name()).increment(1);
        }

        Validated { result, violations }
    }

    fn check(
        &self,
        field: Field,
        text: &str,
        today: Option<NaiveDate>,
        violations: &mut Vec<FieldViolation>,
    ) -> FieldValue {
        match field.kind() {
            FieldKind::Text { max_len } => match format_check(field, text) {
                Ok(()) => truncated(field, text.to_string(), max_len, violations),
                Err(reason) => {
                    violations.push(violation(field, text, reason));
                    FieldValue::Null
                }
            },

            FieldKind::Term {
                max_len,
                vocabulary,
            } => {
                let term = self.snap_or_keep(text, vocabulary);
                truncated(field, term, max_len, violations)
            }

            FieldKind::TermList {
                max_len,
                vocabulary,
            } => {
                let mut terms: Vec<String> = Vec::new();
                for item in text.split([',', ';']).filter_map(normalize_text) {
                    let term = self.snap_or_keep(item, vocabulary);
                    if !terms.iter().any(|t| t.eq_ignore_ascii_case(&term)) {
                        terms.push(term);
                    }
                }
                if terms.is_empty() {
                    return FieldValue::Null;
                }
                truncated(field, terms.join(", "), max_len, violations)
            }

            FieldKind::Enumerated { vocabulary } => match self.taxonomy.snap(text, vocabulary) {
                Snap::Exact(canonical) | Snap::Near { canonical, .. } => FieldValue::Text(canonical),
                Snap::Unmatched => {
                    violations.push(violation(field, text, ViolationReason::NotInVocabulary));
                    FieldValue::Null
                }
            },

            FieldKind::Date => check_date(field, text, today, violations),

            FieldKind::Years => match parse_years(text) {
                Some(years) if (0.0..=MAX_YEARS).contains(&years) => {
                    FieldValue::Years((years * 10.0).round() / 10.0)
                }
                Some(_) => {
                    violations.push(violation(field, text, ViolationReason::OutOfRange));
                    FieldValue::Null
                }
                None => {
                    violations.push(violation(field, text, ViolationReason::NotANumber));
                    FieldValue::Null
                }
            },
        }
    }

    fn snap_or_keep(&self, text: &str, vocabulary: Vocabulary) -> String {
        match self.taxonomy.snap(text, vocabulary) {
            Snap::Exact(canonical) | Snap::Near { canonical, .. } => canonical,
            Snap::Unmatched => text.to_string(),
        }
    }

    /// Replace model-estimated experience with date-derived figures when the
    /// whole work history resolved.
    fn reconcile_experience(
        &self,
        raw: &RawFields,
        today: Option<NaiveDate>,
        result: &mut ExtractionResult,
    ) {
        let spans: Vec<PositionSpan> = POSITIONS
            .iter()
            .enumerate()
            .filter(|(_, p)| !result.get(p.company).is_null())
            .map(|(index, p)| PositionSpan {
                start: result.get(p.start).as_date().map(|date| ResumeDate::On {
                    date,
                    precision: dates::DatePrecision::Day,
                }),
                end: match result.get(p.end).as_date() {
                    Some(date) => Some(ResumeDate::On {
                        date,
                        precision: dates::DatePrecision::Day,
                    }),
                    None => open_end(raw.get(p.end), index == 0),
                },
                location: result.get(p.location).as_text().map(str::to_string),
            })
            .collect();

        if spans.is_empty() {
            return;
        }

        let metrics = dates::experience_metrics(&spans, today);
        let derived = (metrics.counted > 0).then_some(&metrics);
        for (field, value) in [
            (Field::YearsOfExperience, derived.map(|m| m.total_years)),
            (Field::AvgTenure, derived.map(|m| m.avg_tenure_years)),
            (Field::LengthInUs, derived.map(|m| m.us_years)),
        ] {
            let model = result.get(field).as_years();
            let chosen = dates::reconcile_experience(model, value, metrics.complete);
            if chosen != model {
                debug!(
                    user_id = %result.user_id(),
                    field = %field,
                    model = ?model,
                    derived = ?chosen,
                    "Using date-derived experience"
                );
            }
            result.set(field, chosen.map_or(FieldValue::Null, FieldValue::Years));
        }
    }
}

fn check_date(
    field: Field,
    text: &str,
    today: Option<NaiveDate>,
    violations: &mut Vec<FieldViolation>,
) -> FieldValue {
    match dates::parse_resume_date(text) {
        Ok(ResumeDate::On { date, .. }) => match today {
            Some(today) if date > today => {
                violations.push(violation(field, text, ViolationReason::FutureDate));
                FieldValue::Null
            }
            _ => FieldValue::Date(date),
        },
        // An open end is stored as null; the position reads as current.
        Ok(ResumeDate::Present) if !field.is_start_date() => FieldValue::Null,
        Ok(ResumeDate::Present) => {
            violations.push(violation(field, text, ViolationReason::OpenEndedStart));
            FieldValue::Null
        }
        Err(_) => {
            violations.push(violation(field, text, ViolationReason::UnparseableDate));
            FieldValue::Null
        }
    }
}

/// A null end date reads as "present" when the model said so, or when it is
/// the most recent position and nothing was given.
fn open_end(raw: Option<&str>, most_recent: bool) -> Option<ResumeDate> {
    match raw.and_then(normalize_text) {
        Some(text) if dates::is_present_marker(text) => Some(ResumeDate::Present),
        None if most_recent => Some(ResumeDate::Present),
        _ => None,
    }
}

fn violation(field: Field, value: &str, reason: ViolationReason) -> FieldViolation {
    FieldViolation {
        field,
        value: value.to_string(),
        reason,
    }
}

// ── Normalization ────────────────────────────────────────────────────

/// Trim and map empty or sentinel values to `None`.
pub fn normalize_text(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || NULL_SENTINELS.iter().any(|s| trimmed.eq_ignore_ascii_case(s)) {
        None
    } else {
        Some(trimmed)
    }
}

fn truncated(
    field: Field,
    text: String,
    max_len: usize,
    violations: &mut Vec<FieldViolation>,
) -> FieldValue {
    match text.char_indices().nth(max_len) {
        Some((cut, _)) => {
            violations.push(violation(field, &text, ViolationReason::Truncated { limit: max_len }));
            FieldValue::Text(text[..cut].to_string())
        }
        None => FieldValue::Text(text),
    }
}

fn parse_years(text: &str) -> Option<f64> {
    let lowered = text.to_lowercase();
    let number = lowered
        .trim_end_matches('+')
        .trim_end_matches("years")
        .trim_end_matches("year")
        .trim_end_matches("yrs")
        .trim()
        .trim_end_matches('+');
    number.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn format_check(field: Field, text: &str) -> Result<(), ViolationReason> {
    match field {
        Field::Email | Field::Email2 => match text.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
            _ => Err(ViolationReason::InvalidFormat("email address")),
        },
        Field::Linkedin if !text.to_lowercase().contains("linkedin.com/") => {
            Err(ViolationReason::InvalidFormat("LinkedIn URL"))
        }
        Field::Phone1 | Field::Phone2 if phone_digits(text).len() < 7 => {
            Err(ViolationReason::InvalidFormat("phone number"))
        }
        _ => Ok(()),
    }
}

fn phone_digits(text: &str) -> String {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    // A leading US country code does not make a number distinct.
    match digits.strip_prefix('1') {
        Some(rest) if rest.len() == 10 => rest.to_string(),
        _ => digits,
    }
}

fn dedupe_phones(result: &mut ExtractionResult, violations: &mut Vec<FieldViolation>) {
    let (Some(first), Some(second)) = (
        result.get(Field::Phone1).as_text(),
        result.get(Field::Phone2).as_text(),
    ) else {
        return;
    };
    if phone_digits(first) == phone_digits(second) {
        violations.push(violation(Field::Phone2, second, ViolationReason::DuplicatePhone));
        result.set(Field::Phone2, FieldValue::Null);
    }
}
