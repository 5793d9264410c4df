use chrono::{Datelike, NaiveDate};
use thiserror::Error;

/// Words a resume uses for an open-ended position.
const PRESENT_MARKERS: &[&str] = &[
    "present",
    "current",
    "currently",
    "now",
    "to date",
    "today",
    "ongoing",
    "to present",
];

const MIN_YEAR: i32 = 1900;
const MAX_YEAR: i32 = 2100;

const US_STATES: &[&str] = &[
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "DC", "FL", "GA", "HI", "ID", "IL", "IN", "IA",
    "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ", "NM",
    "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT", "VT", "VA", "WA",
    "WV", "WI", "WY",
];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DateError {
    #[error("empty date")]
    Empty,

    #[error("unparseable date: {0:?}")]
    Unparseable(String),

    #[error("year out of range in {0:?}")]
    OutOfRange(String),
}

/// How much of the date was actually written in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePrecision {
    Day,
    Month,
    Year,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDate {
    On {
        date: NaiveDate,
        precision: DatePrecision,
    },
    /// Open-ended; resolved against the processing date.
    Present,
}

impl ResumeDate {
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            ResumeDate::On { date, .. } => Some(*date),
            ResumeDate::Present => None,
        }
    }

    /// Canonical `YYYY-MM-DD`; partial dates are padded to the first day.
    pub fn canonical(&self) -> Option<String> {
        self.date().map(|d| d.format("%Y-%m-%d").to_string())
    }

    /// Concrete date, using `today` for an open-ended value.
    pub fn resolve(&self, today: Option<NaiveDate>) -> Option<NaiveDate> {
        match self {
            ResumeDate::On { date, .. } => Some(*date),
            ResumeDate::Present => today,
        }
    }
}

pub fn is_present_marker(input: &str) -> bool {
    let lowered = input.trim().to_lowercase();
    PRESENT_MARKERS.contains(&lowered.as_str())
}

/// Parse a free-text resume date.
///
/// Accepts `YYYY-MM-DD`, `MM/DD/YYYY`, `YYYY/MM/DD`, `YYYY-MM`, `MM/YYYY`,
/// month-name forms (`Jan 2020`, `January, 2020`, `Sept. 2019`) and a bare
/// year. Present markers map to [`ResumeDate::Present`].
pub fn parse_resume_date(input: &str) -> Result<ResumeDate, DateError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DateError::Empty);
    }
    if is_present_marker(trimmed) {
        return Ok(ResumeDate::Present);
    }

    let parsed = parse_full(trimmed)
        .map(|d| (d, DatePrecision::Day))
        .or_else(|| parse_month_year(trimmed).map(|d| (d, DatePrecision::Month)))
        .or_else(|| parse_year(trimmed).map(|d| (d, DatePrecision::Year)));

    match parsed {
        Some((date, _)) if !(MIN_YEAR..=MAX_YEAR).contains(&date.year()) => {
            Err(DateError::OutOfRange(trimmed.to_string()))
        }
        Some((date, precision)) => Ok(ResumeDate::On { date, precision }),
        None => Err(DateError::Unparseable(trimmed.to_string())),
    }
}

fn parse_full(s: &str) -> Option<NaiveDate> {
    ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

fn parse_month_year(s: &str) -> Option<NaiveDate> {
    if let Some((year, month)) = s.split_once('-') {
        if year.len() == 4 && (1..=2).contains(&month.len()) {
            return first_of(year.parse().ok()?, month.parse().ok()?);
        }
    }
    if let Some((month, year)) = s.split_once('/') {
        if year.len() == 4 && (1..=2).contains(&month.len()) {
            return first_of(year.parse().ok()?, month.parse().ok()?);
        }
    }

    // "Jan 2020", "January, 2020", "Sept. 2019"
    let cleaned: String = s.chars().filter(|c| *c != '.' && *c != ',').collect();
    let mut parts = cleaned.split_whitespace();
    let (month, year) = (parts.next()?, parts.next()?);
    if parts.next().is_some() || year.len() != 4 {
        return None;
    }
    let month = month_number(month)?;
    first_of(year.parse().ok()?, month)
}

fn parse_year(s: &str) -> Option<NaiveDate> {
    if s.len() != 4 || !s.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    first_of(s.parse().ok()?, 1)
}

fn first_of(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
}

fn month_number(name: &str) -> Option<u32> {
    let lowered = name.to_lowercase();
    if lowered.len() < 3 {
        return None;
    }
    const MONTHS: [&str; 12] = [
        "january",
        "february",
        "march",
        "april",
        "may",
        "june",
        "july",
        "august",
        "september",
        "october",
        "november",
        "december",
    ];
    MONTHS
        .iter()
        .position(|m| m.starts_with(&lowered))
        .map(|i| i as u32 + 1)
}

/// Elapsed whole months of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tenure {
    pub months: u32,
}

impl Tenure {
    pub fn years(&self) -> f64 {
        self.months as f64 / 12.0
    }
}

/// Tenure between two resume dates. `today` stands in for an open end.
///
/// Returns `None` when a date cannot be resolved (open end without a
/// processing date, open start) or the end precedes the start.
pub fn tenure(start: &ResumeDate, end: &ResumeDate, today: Option<NaiveDate>) -> Option<Tenure> {
    let start = start.date()?;
    let end = end.resolve(today)?;
    if end < start {
        return None;
    }

    let mut months = (end.year() - start.year()) * 12 + end.month() as i32 - start.month() as i32;
    if end.day() < start.day() {
        months -= 1;
    }
    Some(Tenure {
        months: months.max(0) as u32,
    })
}

/// True if a position location names the United States or ends in a state code.
pub fn is_us_location(location: &str) -> bool {
    let upper = location.trim().to_uppercase();
    if upper.contains("UNITED STATES")
        || upper.contains("U.S.A")
        || upper.split(|c: char| !c.is_ascii_alphanumeric()).any(|w| w == "USA")
    {
        return true;
    }

    // "Austin, TX" or "Austin, TX 78701"
    upper
        .rsplit(',')
        .next()
        .and_then(|tail| tail.split_whitespace().next())
        .is_some_and(|code| upper.contains(',') && US_STATES.contains(&code))
}

/// One work-history slot as seen by the experience calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSpan {
    pub start: Option<ResumeDate>,
    pub end: Option<ResumeDate>,
    pub location: Option<String>,
}

/// Experience derived from the dated work history.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperienceMetrics {
    pub total_years: f64,
    pub avg_tenure_years: f64,
    pub us_years: f64,
    /// Positions that produced a tenure.
    pub counted: usize,
    /// Every position had both ends resolved.
    pub complete: bool,
}

/// Sum tenures across positions; concurrent positions are not de-overlapped.
pub fn experience_metrics(positions: &[PositionSpan], today: Option<NaiveDate>) -> ExperienceMetrics {
    let mut total_months = 0u32;
    let mut us_months = 0u32;
    let mut counted = 0usize;
    let mut complete = !positions.is_empty();

    for position in positions {
        let span = match (&position.start, &position.end) {
            (Some(start), Some(end)) => tenure(start, end, today),
            _ => None,
        };
        let Some(span) = span else {
            complete = false;
            continue;
        };

        counted += 1;
        total_months += span.months;
        if position.location.as_deref().is_some_and(is_us_location) {
            us_months += span.months;
        }
    }

    let total_years = total_months as f64 / 12.0;
    ExperienceMetrics {
        total_years: round1(total_years),
        avg_tenure_years: if counted > 0 {
            round1(total_years / counted as f64)
        } else {
            0.0
        },
        us_years: round1(us_months as f64 / 12.0),
        counted,
        complete,
    }
}

/// Date-derived value wins only if every contributing position fully parsed.
pub fn reconcile_experience(model: Option<f64>, derived: Option<f64>, complete: bool) -> Option<f64> {
    match derived {
        Some(value) if complete => Some(value),
        _ => model,
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
