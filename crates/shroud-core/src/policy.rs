//! Content filtering policy.
//!
//! Decides whether a detection result should be shown, given the viewer's
//! display preferences. Pure: no engine or queue access.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::types::{DetectionResult, Gender, Verdict};

/// Which faces to hide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenderFilter {
    /// Show every face.
    #[default]
    None,
    /// Hide every face verdict.
    All,
    /// Hide face verdicts whose reported gender matches.
    Specific(Gender),
}

impl Serialize for GenderFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            GenderFilter::None => serializer.serialize_bool(false),
            GenderFilter::All => serializer.serialize_bool(true),
            GenderFilter::Specific(gender) => serializer.serialize_str(gender.name()),
        }
    }
}

struct GenderFilterVisitor;

impl Visitor<'_> for GenderFilterVisitor {
    type Value = GenderFilter;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("a boolean, \"male\" or \"female\"")
    }

    fn visit_bool<E: de::Error>(self, value: bool) -> Result<GenderFilter, E> {
        Ok(if value {
            GenderFilter::All
        } else {
            GenderFilter::None
        })
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<GenderFilter, E> {
        match Gender::parse(value) {
            Some(gender @ (Gender::Male | Gender::Female)) => Ok(GenderFilter::Specific(gender)),
            _ => Err(E::invalid_value(de::Unexpected::Str(value), &self)),
        }
    }
}

impl<'de> Deserialize<'de> for GenderFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(GenderFilterVisitor)
    }
}

/// Show/hide outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDecision {
    pub show: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl FilterDecision {
    fn show() -> Self {
        Self {
            show: true,
            reason: None,
        }
    }

    fn hide(reason: impl Into<String>) -> Self {
        Self {
            show: false,
            reason: Some(reason.into()),
        }
    }
}

/// Applies display preferences to a detection result.
///
/// Failed detections are always shown.
pub fn decide(result: &DetectionResult, hide_nsfw: bool, hide_gender: GenderFilter) -> FilterDecision {
    match result.result {
        Verdict::Error | Verdict::Clear => FilterDecision::show(),
        Verdict::Nsfw if hide_nsfw => FilterDecision::hide("NSFW content detected"),
        Verdict::Nsfw => FilterDecision::show(),
        Verdict::Face => match hide_gender {
            GenderFilter::None => FilterDecision::show(),
            GenderFilter::All => FilterDecision::hide("Face content detected"),
            GenderFilter::Specific(gender) if result.gender == Some(gender) => {
                FilterDecision::hide(format!("{} content detected", gender))
            }
            GenderFilter::Specific(_) => FilterDecision::show(),
        },
    }
}
