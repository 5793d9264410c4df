use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::models::resume::UserId;
use crate::services::taxonomy::Vocabulary;

/// Every datum the pipeline extracts for a candidate.
///
/// The serialized name of each variant is both the JSON key the model is asked
/// to produce and the column name in the candidate table.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
pub enum Field {
    PrimaryTitle,
    SecondaryTitle,
    TertiaryTitle,
    Address,
    City,
    State,
    ZipCode,
    Certifications,
    Bachelors,
    Masters,
    Phone1,
    Phone2,
    Email,
    Email2,
    FirstName,
    MiddleName,
    LastName,
    Linkedin,

    MostRecentCompany,
    MostRecentStartDate,
    MostRecentEndDate,
    MostRecentLocation,
    SecondMostRecentCompany,
    SecondMostRecentStartDate,
    SecondMostRecentEndDate,
    SecondMostRecentLocation,
    ThirdMostRecentCompany,
    ThirdMostRecentStartDate,
    ThirdMostRecentEndDate,
    ThirdMostRecentLocation,
    FourthMostRecentCompany,
    FourthMostRecentStartDate,
    FourthMostRecentEndDate,
    FourthMostRecentLocation,
    FifthMostRecentCompany,
    FifthMostRecentStartDate,
    FifthMostRecentEndDate,
    FifthMostRecentLocation,
    SixthMostRecentCompany,
    SixthMostRecentStartDate,
    SixthMostRecentEndDate,
    SixthMostRecentLocation,
    SeventhMostRecentCompany,
    SeventhMostRecentStartDate,
    SeventhMostRecentEndDate,
    SeventhMostRecentLocation,

    PrimaryIndustry,
    SecondaryIndustry,

    Skill1,
    Skill2,
    Skill3,
    Skill4,
    Skill5,
    Skill6,
    Skill7,
    Skill8,
    Skill9,
    Skill10,
    PrimarySoftwareLanguage,
    SecondarySoftwareLanguage,
    TertiarySoftwareLanguage,
    SoftwareApp1,
    SoftwareApp2,
    SoftwareApp3,
    SoftwareApp4,
    SoftwareApp5,
    Hardware1,
    Hardware2,
    Hardware3,
    Hardware4,
    Hardware5,
    PrimaryCategory,
    SecondaryCategory,
    ProjectTypes,
    Specialty,
    Summary,

    #[strum(serialize = "LengthinUS")]
    #[serde(rename = "LengthinUS")]
    LengthInUs,
    #[strum(serialize = "YearsofExperience")]
    #[serde(rename = "YearsofExperience")]
    YearsOfExperience,
    AvgTenure,
}

/// Semantic type of a field, which decides how its raw value is validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Plain text bounded by the column width.
    Text { max_len: usize },
    /// Free text snapped onto a canonical taxonomy term when one is close enough.
    Term { max_len: usize, vocabulary: Vocabulary },
    /// Comma-separated terms, each snapped independently.
    TermList { max_len: usize, vocabulary: Vocabulary },
    /// Must resolve to a canonical term, otherwise the field is nulled.
    Enumerated { vocabulary: Vocabulary },
    Date,
    /// A non-negative number of years.
    Years,
}

/// Which request of the two-step flow is responsible for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStep {
    Profile,
    Expertise,
}

/// Column group describing one work-history slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionFields {
    pub company: Field,
    pub start: Field,
    pub end: Field,
    pub location: Field,
}

/// The seven work-history slots, most recent first.
pub const POSITIONS: [PositionFields; 7] = [
    PositionFields {
        company: Field::MostRecentCompany,
        start: Field::MostRecentStartDate,
        end: Field::MostRecentEndDate,
        location: Field::MostRecentLocation,
    },
    PositionFields {
        company: Field::SecondMostRecentCompany,
        start: Field::SecondMostRecentStartDate,
        end: Field::SecondMostRecentEndDate,
        location: Field::SecondMostRecentLocation,
    },
    PositionFields {
        company: Field::ThirdMostRecentCompany,
        start: Field::ThirdMostRecentStartDate,
        end: Field::ThirdMostRecentEndDate,
        location: Field::ThirdMostRecentLocation,
    },
    PositionFields {
        company: Field::FourthMostRecentCompany,
        start: Field::FourthMostRecentStartDate,
        end: Field::FourthMostRecentEndDate,
        location: Field::FourthMostRecentLocation,
    },
    PositionFields {
        company: Field::FifthMostRecentCompany,
        start: Field::FifthMostRecentStartDate,
        end: Field::FifthMostRecentEndDate,
        location: Field::FifthMostRecentLocation,
    },
    PositionFields {
        company: Field::SixthMostRecentCompany,
        start: Field::SixthMostRecentStartDate,
        end: Field::SixthMostRecentEndDate,
        location: Field::SixthMostRecentLocation,
    },
    PositionFields {
        company: Field::SeventhMostRecentCompany,
        start: Field::SeventhMostRecentStartDate,
        end: Field::SeventhMostRecentEndDate,
        location: Field::SeventhMostRecentLocation,
    },
];

impl Field {
    /// JSON key and column name.
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Unquoted (lowercase) column identifier in the candidate table.
    pub fn column(self) -> String {
        self.name().to_lowercase()
    }

    pub fn kind(self) -> FieldKind {
        use Field::*;
        match self {
            MostRecentStartDate | MostRecentEndDate | SecondMostRecentStartDate
            | SecondMostRecentEndDate | ThirdMostRecentStartDate | ThirdMostRecentEndDate
            | FourthMostRecentStartDate | FourthMostRecentEndDate | FifthMostRecentStartDate
            | FifthMostRecentEndDate | SixthMostRecentStartDate | SixthMostRecentEndDate
            | SeventhMostRecentStartDate | SeventhMostRecentEndDate => FieldKind::Date,

            LengthInUs | YearsOfExperience | AvgTenure => FieldKind::Years,

            PrimaryIndustry | SecondaryIndustry => FieldKind::Enumerated {
                vocabulary: Vocabulary::Industries,
            },
            PrimaryCategory | SecondaryCategory => FieldKind::Enumerated {
                vocabulary: Vocabulary::SkillCategories,
            },

            Skill1 | Skill2 | Skill3 | Skill4 | Skill5 | Skill6 | Skill7 | Skill8 | Skill9
            | Skill10 => FieldKind::Term {
                max_len: 100,
                vocabulary: Vocabulary::Skills,
            },
            PrimarySoftwareLanguage | SecondarySoftwareLanguage | TertiarySoftwareLanguage
            | SoftwareApp1 | SoftwareApp2 | SoftwareApp3 | SoftwareApp4 | SoftwareApp5
            | Hardware1 | Hardware2 | Hardware3 | Hardware4 | Hardware5 => FieldKind::Term {
                max_len: 255,
                vocabulary: Vocabulary::Skills,
            },
            ProjectTypes => FieldKind::TermList {
                max_len: 8000,
                vocabulary: Vocabulary::ProjectTypes,
            },

            Certifications | Specialty | Summary => FieldKind::Text { max_len: 8000 },
            City | FirstName | MiddleName | LastName => FieldKind::Text { max_len: 100 },
            State | Phone1 | Phone2 => FieldKind::Text { max_len: 50 },
            ZipCode => FieldKind::Text { max_len: 10 },
            _ => FieldKind::Text { max_len: 255 },
        }
    }

    /// Whether the field may legitimately be empty for a well-formed resume.
    ///
    /// A resume without any employer is treated as an extraction defect, so
    /// the most recent company is the one field that is flagged when null.
    pub fn nullable(self) -> bool {
        !matches!(self, Field::MostRecentCompany)
    }

    pub fn step(self) -> ExtractionStep {
        use Field::*;
        match self {
            Skill1 | Skill2 | Skill3 | Skill4 | Skill5 | Skill6 | Skill7 | Skill8 | Skill9
            | Skill10 | PrimarySoftwareLanguage | SecondarySoftwareLanguage
            | TertiarySoftwareLanguage | SoftwareApp1 | SoftwareApp2 | SoftwareApp3
            | SoftwareApp4 | SoftwareApp5 | Hardware1 | Hardware2 | Hardware3 | Hardware4
            | Hardware5 | PrimaryCategory | SecondaryCategory | ProjectTypes | Specialty
            | Summary | LengthInUs | YearsOfExperience | AvgTenure => ExtractionStep::Expertise,
            _ => ExtractionStep::Profile,
        }
    }

    pub fn is_start_date(self) -> bool {
        POSITIONS.iter().any(|p| p.start == self)
    }

    pub fn in_step(step: ExtractionStep) -> impl Iterator<Item = Field> {
        Field::iter().filter(move |f| f.step() == step)
    }
}

/// A validated, typed value. `Null` is explicit so no field is ever silently absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Text(String),
    Date(NaiveDate),
    Years(f64),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_years(&self) -> Option<f64> {
        match self {
            FieldValue::Years(y) => Some(*y),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("NULL"),
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            FieldValue::Years(y) => write!(f, "{y:.1}"),
        }
    }
}

/// Untyped model output for one resume, keyed by schema field.
///
/// Keys the schema does not know are kept aside in `extras`; they never reach
/// validation but can feed follow-up prompts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFields {
    values: BTreeMap<Field, String>,
    extras: BTreeMap<String, String>,
}

impl RawFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: Field, value: impl Into<String>) {
        self.values.insert(field, value.into());
    }

    pub fn insert_extra(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extras.insert(key.into(), value.into());
    }

    pub fn get(&self, field: Field) -> Option<&str> {
        self.values.get(&field).map(String::as_str)
    }

    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extras.get(key).map(String::as_str)
    }

    /// Overlays `other` onto `self`; later steps win on conflicting keys.
    pub fn merge(&mut self, other: RawFields) {
        self.values.extend(other.values);
        self.extras.extend(other.extras);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Validated values for one candidate, holding an entry for every schema field.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionResult {
    user_id: UserId,
    values: BTreeMap<Field, FieldValue>,
}

impl ExtractionResult {
    /// A result with every field explicitly null.
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            values: Field::iter().map(|f| (f, FieldValue::Null)).collect(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn get(&self, field: Field) -> &FieldValue {
        // Every field is inserted by `empty`, and `set` only replaces.
        self.values.get(&field).unwrap_or(&FieldValue::Null)
    }

    pub fn set(&mut self, field: Field, value: FieldValue) {
        self.values.insert(field, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (Field, &FieldValue)> {
        self.values.iter().map(|(f, v)| (*f, v))
    }

    pub fn populated(&self) -> usize {
        self.values.values().filter(|v| !v.is_null()).count()
    }
}
