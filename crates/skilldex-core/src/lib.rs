//! Core domain model and state-diff types for Skilldex.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "skilldex-core";

/// Field name (e.g. "backend") to the set of skills mentioned under it.
pub type SkillMap = BTreeMap<String, BTreeSet<String>>;

/// Identity of one offer, unique per scrape period.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OfferId {
    pub id: String,
    pub year: i32,
    pub month: u32,
}

impl OfferId {
    pub fn new(id: impl Into<String>, year: i32, month: u32) -> Self {
        Self {
            id: id.into(),
            year,
            month,
        }
    }
}

impl fmt::Display for OfferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:04}-{:02}", self.id, self.year, self.month)
    }
}

/// Full denormalized view of one offer as seen by the reconciliation engine.
///
/// The canonical persisted row holds only `features` and `careers`; `skills`
/// is always re-derived from the skill index so there is a single source of
/// truth for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub features: BTreeMap<String, String>,
    pub careers: BTreeSet<String>,
    pub skills: SkillMap,
}

impl Offer {
    pub fn new(id: OfferId) -> Self {
        Self {
            id,
            features: BTreeMap::new(),
            careers: BTreeSet::new(),
            skills: SkillMap::new(),
        }
    }
}

/// Freshly scraped offer sitting in the staging buffer. Skills are not known
/// yet; they are extracted during promotion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedOffer {
    pub id: OfferId,
    pub features: BTreeMap<String, String>,
    pub careers: BTreeSet<String>,
}

/// An offer waiting for manual or automatic processing.
///
/// `process_at` is `None` for offers parked without a schedule; they sort
/// ahead of every timestamped entry in the ordered queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOffer {
    pub id: OfferId,
    pub auto_process: bool,
    pub process_at: Option<DateTime<Utc>>,
}

/// Minimal change set between two observed states of the same offer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfferDelta {
    pub careers_added: BTreeSet<String>,
    pub careers_removed: BTreeSet<String>,
    pub skills_added: SkillMap,
    pub skills_removed: SkillMap,
}

impl OfferDelta {
    pub fn between(
        old_careers: &BTreeSet<String>,
        old_skills: &SkillMap,
        new_careers: &BTreeSet<String>,
        new_skills: &SkillMap,
    ) -> Self {
        Self {
            careers_added: new_careers.difference(old_careers).cloned().collect(),
            careers_removed: old_careers.difference(new_careers).cloned().collect(),
            skills_added: skill_map_subtract(new_skills, old_skills),
            skills_removed: skill_map_subtract(old_skills, new_skills),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.careers_added.is_empty()
            && self.careers_removed.is_empty()
            && self.skills_added.is_empty()
            && self.skills_removed.is_empty()
    }
}

/// Per-field set difference `minuend - subtrahend`. A field absent from the
/// subtrahend contributes all of its skills; fields whose difference is empty
/// are omitted so the result stays sparse.
pub fn skill_map_subtract(minuend: &SkillMap, subtrahend: &SkillMap) -> SkillMap {
    let mut result = SkillMap::new();
    for (field, skills) in minuend {
        let remaining: BTreeSet<String> = match subtrahend.get(field) {
            Some(other) => skills.difference(other).cloned().collect(),
            None => skills.clone(),
        };
        if !remaining.is_empty() {
            result.insert(field.clone(), remaining);
        }
    }
    result
}
