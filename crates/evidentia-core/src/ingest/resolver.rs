use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::extractor::ExtractedEntity;
use crate::entity::EntityType;

const STOP_WORDS: &[&str] = &["the", "a", "an", "of", "for", "in", "on", "to", "by", "with"];

/// Comparison key for surface forms: lowercase, no trailing punctuation,
/// no articles or short prepositions, single spaces.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    let lower = name
        .trim()
        .trim_end_matches(['.', ',', ';', ':', '!', '?'])
        .to_lowercase();
    let kept: Vec<&str> = lower
        .split_whitespace()
        .filter(|word| !STOP_WORDS.contains(word))
        .collect();
    if kept.is_empty() {
        lower.split_whitespace().collect::<Vec<_>>().join(" ")
    } else {
        kept.join(" ")
    }
}

/// Canonical entity for one `(type, normalized name)` group within an
/// evidence item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEntity {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub canonical_name: String,
    pub normalized_name: String,
    pub aliases: Vec<String>,
    pub fragment_ids: BTreeSet<Uuid>,
    pub confidence: f64,
    pub mention_count: usize,
}

impl ResolvedEntity {
    /// Stable across re-runs over the same evidence item.
    #[must_use]
    pub fn stable_id(evidence_id: Uuid, entity_type: EntityType, normalized: &str) -> Uuid {
        Uuid::new_v5(
            &evidence_id,
            format!("{}:{}", entity_type.as_str(), normalized).as_bytes(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityReason {
    Containment,
    Acronym,
    WordOverlap,
    NearSpelling,
}

impl fmt::Display for SimilarityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Containment => "one name contains the other",
            Self::Acronym => "one name is an acronym of the other",
            Self::WordOverlap => "names share most of their words",
            Self::NearSpelling => "names are spelled almost the same",
        };
        f.write_str(s)
    }
}

/// Two resolved entities of the same type that may name the same thing.
/// Reported for review, never merged automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCandidate {
    pub entity_type: EntityType,
    pub first_id: Uuid,
    pub second_id: Uuid,
    pub first_name: String,
    pub second_name: String,
    pub reason: SimilarityReason,
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub entities: Vec<ResolvedEntity>,
    pub duplicate_candidates: Vec<DuplicateCandidate>,
}

impl Resolution {
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

pub struct EntityResolver {
    near_spelling_threshold: f64,
}

impl EntityResolver {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            near_spelling_threshold: 0.92,
        }
    }

    #[must_use]
    pub const fn with_near_spelling_threshold(mut self, threshold: f64) -> Self {
        self.near_spelling_threshold = threshold;
        self
    }

    /// Merges mentions by `(type, normalized name)`. The result depends only
    /// on the multiset of mentions, not on their order.
    #[must_use]
    pub fn resolve(&self, evidence_id: Uuid, mentions: &[ExtractedEntity]) -> Resolution {
        let mut groups: BTreeMap<(EntityType, String), Vec<&ExtractedEntity>> = BTreeMap::new();
        for mention in mentions {
            let normalized = normalize_name(&mention.text);
            if normalized.is_empty() {
                continue;
            }
            groups
                .entry((mention.entity_type, normalized))
                .or_default()
                .push(mention);
        }

        let entities: Vec<ResolvedEntity> = groups
            .into_iter()
            .filter_map(|((entity_type, normalized), group)| {
                let canonical = group.iter().copied().max_by(|a, b| {
                    a.confidence
                        .total_cmp(&b.confidence)
                        .then_with(|| b.text.cmp(&a.text))
                })?;
                let canonical_name = canonical.text.trim().to_string();
                let aliases: BTreeSet<String> = group
                    .iter()
                    .map(|m| m.text.trim().to_string())
                    .filter(|name| *name != canonical_name)
                    .collect();

                Some(ResolvedEntity {
                    id: ResolvedEntity::stable_id(evidence_id, entity_type, &normalized),
                    entity_type,
                    canonical_name,
                    aliases: aliases.into_iter().collect(),
                    fragment_ids: group.iter().map(|m| m.fragment_id).collect(),
                    confidence: canonical.confidence,
                    mention_count: group.len(),
                    normalized_name: normalized,
                })
            })
            .collect();

        let duplicate_candidates = self.duplicate_candidates(&entities);
        Resolution {
            entities,
            duplicate_candidates,
        }
    }

    fn duplicate_candidates(&self, entities: &[ResolvedEntity]) -> Vec<DuplicateCandidate> {
        let mut candidates = Vec::new();
        for (i, a) in entities.iter().enumerate() {
            for b in entities[i + 1..]
                .iter()
                .take_while(|b| b.entity_type == a.entity_type)
            {
                if let Some(reason) = self.similarity(&a.normalized_name, &b.normalized_name) {
                    candidates.push(DuplicateCandidate {
                        entity_type: a.entity_type,
                        first_id: a.id,
                        second_id: b.id,
                        first_name: a.canonical_name.clone(),
                        second_name: b.canonical_name.clone(),
                        reason,
                    });
                }
            }
        }
        candidates
    }

    fn similarity(&self, a: &str, b: &str) -> Option<SimilarityReason> {
        if a == b {
            return None;
        }
        if a.contains(b) || b.contains(a) {
            return Some(SimilarityReason::Containment);
        }

        let words_a: Vec<&str> = a.split_whitespace().collect();
        let words_b: Vec<&str> = b.split_whitespace().collect();
        if is_acronym(&words_a, &words_b) || is_acronym(&words_b, &words_a) {
            return Some(SimilarityReason::Acronym);
        }

        let set_a: BTreeSet<&str> = words_a.iter().copied().collect();
        let set_b: BTreeSet<&str> = words_b.iter().copied().collect();
        let smaller = set_a.len().min(set_b.len());
        if smaller >= 2 {
            let shared = set_a.intersection(&set_b).count();
            if shared * 2 >= smaller {
                return Some(SimilarityReason::WordOverlap);
            }
        }

        if strsim::jaro_winkler(a, b) >= self.near_spelling_threshold {
            return Some(SimilarityReason::NearSpelling);
        }
        None
    }
}

impl Default for EntityResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn is_acronym(long: &[&str], short: &[&str]) -> bool {
    if long.len() < 2 || short.len() != 1 {
        return false;
    }
    let initials: String = long.iter().filter_map(|w| w.chars().next()).collect();
    initials == short[0]
}
