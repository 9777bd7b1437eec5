use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::entity::EntityType;
use crate::evidence::EvidenceFragment;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Extraction failed: {0}")]
    Failed(String),
    #[error("Extraction service unavailable: {0}")]
    Unavailable(String),
    #[error("Extraction timed out after {0:?}")]
    Timeout(Duration),
    #[error("Invalid extraction response: {0}")]
    InvalidResponse(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type ExtractionResult<T> = Result<T, ExtractionError>;

/// Confidence added when an entity matches one of the engagement's seed terms.
pub const SEED_TERM_BOOST: f64 = 0.15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub fragment_id: Uuid,
    pub entity_type: EntityType,
    pub text: String,
    pub confidence: f64,
}

impl ExtractedEntity {
    #[must_use]
    pub fn new(fragment_id: Uuid, entity_type: EntityType, text: impl Into<String>, confidence: f64) -> Self {
        Self {
            fragment_id,
            entity_type,
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    RuleBased,
    Remote,
    Scripted,
}

#[async_trait::async_trait]
pub trait Extractor: Send + Sync {
    fn strategy(&self) -> ExtractionStrategy;

    async fn extract(&self, text: &str, fragment_id: Uuid) -> ExtractionResult<Vec<ExtractedEntity>>;
}

pub struct ExtractionPattern {
    pub entity_type: EntityType,
    pub regex: Regex,
    pub confidence: f64,
}

impl ExtractionPattern {
    pub fn new(entity_type: EntityType, pattern: &str, confidence: f64) -> Result<Self, regex::Error> {
        Ok(Self {
            entity_type,
            regex: Regex::new(pattern)?,
            confidence,
        })
    }
}

const ACTIVITY_IMPERATIVE: &str = concat!(
    r"\b(Create|Submit|Approve|Review|Process|Validate|Verify|Execute|Perform|",
    r"Generate|Complete|Update|Send|Receive|Record|Prepare|Assess|Evaluate|",
    r"Initiate|Authorize|Reject|Cancel|Close|Open|Assign|Escalate|Monitor|",
    r"Audit|Reconcile|Notify|Request|Transfer|Archive|Retrieve|Publish|",
    r"Analyze|Configure|Deploy|Test|Sign|Route|Classify|Calculate|",
    r"Distribute|Collect|Upload|Download|Merge|Split|Consolidate|",
    r"Register|Enroll|Onboard|Offboard|Terminate|Suspend|Reactivate)",
    r"\s+([A-Z][a-zA-Z]*(?:\s+[A-Z][a-zA-Z]*){0,4})",
);

const ACTIVITY_GERUND: &str = concat!(
    r"(?i)\b(creating|submitting|approving|reviewing|processing|validating|",
    r"verifying|executing|performing|generating|completing|updating|",
    r"sending|receiving|recording|preparing|assessing|evaluating)",
    r"\s+(?:the\s+)?([a-zA-Z]+(?:\s+[a-zA-Z]+){0,3})",
);

const ROLE_TITLE: &str = concat!(
    r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\s+",
    r"(?:Manager|Director|Officer|Specialist|Analyst|Coordinator|",
    r"Administrator|Supervisor|Lead|Engineer|Architect|Consultant|",
    r"Auditor|Controller|Representative|Assistant|Clerk|Technician|",
    r"Advisor|Planner|Developer|Designer|Scientist|Strategist))\b",
);

const ROLE_REFERENCE: &str = concat!(
    r"(?i)\bthe\s+(approver|reviewer|requestor|requester|submitter|",
    r"authorizer|administrator|operator|owner|custodian|manager|",
    r"processor|validator|verifier|auditor|controller|coordinator)\b",
);

const ROLE_UNIT: &str = concat!(
    r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\s+",
    r"(?:Team|Department|Group|Division|Unit|Committee|Board))\b",
);

const SYSTEM_KNOWN: &str = concat!(
    r"\b(SAP|Oracle|Salesforce|Workday|ServiceNow|Jira|Confluence|",
    r"SharePoint|Teams|Slack|Tableau|Power\s?BI|Snowflake|AWS|Azure|",
    r"GCP|Kubernetes|Jenkins|GitHub|GitLab|Splunk|Datadog|PeopleSoft|",
    r"Dynamics\s?365|NetSuite|Coupa|Ariba|Concur|SuccessFactors|",
    r"HubSpot|Marketo|Zendesk|Freshdesk|Asana|Monday|Notion)\b",
);

// Case-sensitive: the capture relies on capitalization to find proper nouns.
const SYSTEM_NAMED: &str = concat!(
    r"\b([A-Z][A-Za-z0-9]*(?:\s+[A-Z][A-Za-z0-9]*)*)\s+",
    r"(?:[Ss]ystem|[Pp]latform|[Aa]pplication|[Ss]oftware|[Tt]ool|[Mm]odule|",
    r"[Ss]olution|[Pp]ortal|[Dd]atabase|[Ss]erver|[Ss]ervice|[Ii]nterface|[Ee]ngine)\b",
);

const DECISION_CONDITIONAL: &str = concat!(
    r"(?i)\b(if|when|where|unless|provided\s+that|in\s+case)\s+",
    r"(.{5,80}?)(?:\s*,|\s*then|\s*:|\.\s)",
);

const DECISION_EXPLICIT: &str = concat!(
    r"(?i)\b(?:decision|determine|decide|evaluate\s+whether)\s+",
    r"(?:to\s+|whether\s+)?(.{5,60}?)(?:\.|,|\s+and\s+|\s+or\s+)",
);

const DECISION_THRESHOLD: &str = concat!(
    r"(?i)\b(?:threshold|limit|criteria|condition|rule)\s+",
    r"(?:of|for|is|exceeds?|below|above)\s+(.{3,60}?)(?:\.|,)",
);

const DOCUMENT_KIND: &str = concat!(
    r"(?i)\b((?:Purchase\s+Order|Invoice|Contract|Agreement|Policy|",
    r"Procedure|Manual|Guideline|Standard|Report|Template|Form|",
    r"Certificate|License|Permit|Statement|Receipt|Voucher|",
    r"Memo|Memorandum|Charter|Specification|Requirement|",
    r"Work\s+Order|Service\s+Level\s+Agreement|SLA|",
    r"Request\s+for\s+Proposal|RFP|Request\s+for\s+Quotation|RFQ|",
    r"Bill\s+of\s+Materials|BOM|Bill\s+of\s+Lading|BOL|",
    r"Terms\s+of\s+Reference|TOR|Statement\s+of\s+Work|SOW)",
    r"(?:\s+#?\d+)?)\b",
);

const KNOWN_SYSTEMS: &[&str] = &[
    "sap", "oracle", "salesforce", "workday", "servicenow", "jira", "confluence",
    "sharepoint", "teams", "slack", "tableau", "power bi", "powerbi", "snowflake",
    "aws", "azure", "gcp", "kubernetes", "jenkins", "github", "gitlab",
];

/// Regex extractor for process-mining vocabulary: activities, roles,
/// systems, decisions and documents.
pub struct RuleBasedExtractor {
    patterns: Vec<ExtractionPattern>,
    seed_terms: BTreeSet<String>,
}

impl RuleBasedExtractor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            patterns: Vec::new(),
            seed_terms: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_pattern(mut self, pattern: ExtractionPattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    #[must_use]
    pub fn with_default_patterns() -> Self {
        let table = [
            (EntityType::Activity, ACTIVITY_IMPERATIVE, 0.7),
            (EntityType::Activity, ACTIVITY_GERUND, 0.7),
            (EntityType::Role, ROLE_TITLE, 0.8),
            (EntityType::Role, ROLE_REFERENCE, 0.6),
            (EntityType::Role, ROLE_UNIT, 0.8),
            (EntityType::System, SYSTEM_KNOWN, 0.9),
            (EntityType::System, SYSTEM_NAMED, 0.7),
            (EntityType::Decision, DECISION_CONDITIONAL, 0.6),
            (EntityType::Decision, DECISION_EXPLICIT, 0.6),
            (EntityType::Decision, DECISION_THRESHOLD, 0.6),
            (EntityType::Document, DOCUMENT_KIND, 0.8),
        ];

        let mut extractor = Self::new();
        for (entity_type, pattern, confidence) in table {
            match ExtractionPattern::new(entity_type, pattern, confidence) {
                Ok(p) => extractor.patterns.push(p),
                Err(e) => tracing::warn!("Skipping {} pattern: {}", entity_type, e),
            }
        }
        extractor
    }

    /// Engagement vocabulary; matching entities get [`SEED_TERM_BOOST`].
    #[must_use]
    pub fn with_seed_terms<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.seed_terms = terms
            .into_iter()
            .map(|t| t.as_ref().trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        self
    }

    fn name_for(captures: &regex::Captures<'_>) -> String {
        match (captures.get(1), captures.get(2)) {
            (Some(lead), Some(rest)) => clean_name(&format!("{} {}", lead.as_str(), rest.as_str())),
            (Some(group), None) => clean_name(group.as_str()),
            _ => clean_name(captures.get(0).map_or("", |m| m.as_str())),
        }
    }

    fn matched_seed(&self, name: &str) -> Option<&str> {
        let lower = name.trim().to_lowercase();
        if let Some(seed) = self.seed_terms.get(&lower) {
            return Some(seed.as_str());
        }
        self.seed_terms
            .iter()
            .find(|seed| seed.len() >= 3 && (lower.contains(seed.as_str()) || seed.contains(&lower)))
            .map(String::as_str)
    }

    /// Synchronous core of [`Extractor::extract`].
    #[must_use]
    pub fn extract_text(&self, text: &str, fragment_id: Uuid) -> Vec<ExtractedEntity> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut entities = Vec::new();
        let mut seen: HashSet<(EntityType, String)> = HashSet::new();

        for pattern in &self.patterns {
            for captures in pattern.regex.captures_iter(text) {
                let whole = captures.get(0).map_or("", |m| m.as_str());
                let name = Self::name_for(&captures);
                if name.chars().count() < min_name_len(pattern.entity_type) {
                    continue;
                }
                if !seen.insert((pattern.entity_type, name.to_lowercase())) {
                    continue;
                }

                let mut confidence = match pattern.entity_type {
                    EntityType::Role if whole.starts_with(char::is_uppercase) => 0.8,
                    EntityType::Role => 0.6,
                    EntityType::System if KNOWN_SYSTEMS.contains(&name.to_lowercase().as_str()) => 0.9,
                    EntityType::System => 0.7,
                    _ => pattern.confidence,
                };
                if self.matched_seed(&name).is_some() {
                    confidence = (confidence + SEED_TERM_BOOST).min(1.0);
                }

                entities.push(ExtractedEntity::new(fragment_id, pattern.entity_type, name, confidence));
            }
        }

        entities
    }
}

impl Default for RuleBasedExtractor {
    fn default() -> Self {
        Self::with_default_patterns()
    }
}

const fn min_name_len(entity_type: EntityType) -> usize {
    match entity_type {
        EntityType::Activity => 5,
        EntityType::Decision => 8,
        EntityType::Role | EntityType::Document => 3,
        EntityType::System => 2,
    }
}

/// Trims, drops trailing punctuation and collapses inner whitespace.
fn clean_name(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(['.', ',', ';', ':', '!', '?'])
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait::async_trait]
impl Extractor for RuleBasedExtractor {
    fn strategy(&self) -> ExtractionStrategy {
        ExtractionStrategy::RuleBased
    }

    async fn extract(&self, text: &str, fragment_id: Uuid) -> ExtractionResult<Vec<ExtractedEntity>> {
        Ok(self.extract_text(text, fragment_id))
    }
}

#[derive(Serialize)]
struct ExtractionRequest<'a> {
    text: &'a str,
    fragment_id: Uuid,
}

#[derive(Deserialize)]
struct ExtractionResponse {
    entities: Vec<RemoteEntity>,
}

#[derive(Deserialize)]
struct RemoteEntity {
    #[serde(rename = "type")]
    entity_type: String,
    text: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

const fn default_confidence() -> f64 {
    0.5
}

/// Client for a remote extraction service that accepts
/// `{text, fragment_id}` and answers `{entities: [{type, text, confidence}]}`.
pub struct HttpExtractor {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl HttpExtractor {
    pub fn new(endpoint: &str, timeout: Duration) -> ExtractionResult<Self> {
        let endpoint = url::Url::parse(endpoint)
            .map_err(|e| ExtractionError::Unavailable(format!("invalid endpoint {endpoint}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("evidentia/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait::async_trait]
impl Extractor for HttpExtractor {
    fn strategy(&self) -> ExtractionStrategy {
        ExtractionStrategy::Remote
    }

    async fn extract(&self, text: &str, fragment_id: Uuid) -> ExtractionResult<Vec<ExtractedEntity>> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&ExtractionRequest { text, fragment_id })
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ExtractionError::Unavailable(status.to_string()));
        }
        if !status.is_success() {
            return Err(ExtractionError::Failed(format!("extraction service returned {status}")));
        }

        let body: ExtractionResponse = response
            .json()
            .await
            .map_err(|e| ExtractionError::InvalidResponse(e.to_string()))?;

        Ok(body
            .entities
            .into_iter()
            .filter_map(|remote| match EntityType::from_str(&remote.entity_type) {
                Ok(entity_type) if !remote.text.trim().is_empty() => Some(ExtractedEntity::new(
                    fragment_id,
                    entity_type,
                    remote.text.trim(),
                    remote.confidence,
                )),
                Ok(_) => None,
                Err(_) => {
                    tracing::debug!("Ignoring entity of unknown type {:?}", remote.entity_type);
                    None
                }
            })
            .collect())
    }
}

/// Entities from every fragment that extracted cleanly, plus the
/// fragments that did not.
#[derive(Debug, Clone, Default)]
pub struct ExtractionRun {
    pub entities: Vec<ExtractedEntity>,
    pub failed_fragments: Vec<Uuid>,
}

impl ExtractionRun {
    #[must_use]
    pub fn failures(&self) -> usize {
        self.failed_fragments.len()
    }
}

/// Runs `extractor` over every fragment with at most `concurrency` calls in
/// flight. A failed or timed-out fragment is logged and contributes nothing.
pub async fn extract_fragments(
    extractor: Arc<dyn Extractor>,
    fragments: &[EvidenceFragment],
    concurrency: usize,
    timeout: Duration,
) -> ExtractionRun {
    let jobs: Vec<(u32, Uuid, String)> = fragments
        .iter()
        .map(|f| (f.ordinal, f.id, f.content.clone()))
        .collect();

    let mut outcomes: Vec<(u32, Uuid, ExtractionResult<Vec<ExtractedEntity>>)> =
        stream::iter(jobs)
            .map(move |(ordinal, fragment_id, content)| {
                let extractor = Arc::clone(&extractor);
                async move {
                    let result =
                        match tokio::time::timeout(timeout, extractor.extract(&content, fragment_id))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(ExtractionError::Timeout(timeout)),
                        };
                    (ordinal, fragment_id, result)
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

    outcomes.sort_by_key(|(ordinal, _, _)| *ordinal);

    let mut run = ExtractionRun::default();
    for (_, fragment_id, outcome) in outcomes {
        match outcome {
            Ok(entities) => run.entities.extend(entities),
            Err(e) => {
                tracing::warn!(fragment_id = %fragment_id, "Entity extraction failed: {}", e);
                run.failed_fragments.push(fragment_id);
            }
        }
    }
    run
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EvidenceFragment, FragmentDraft};

    fn names(entities: &[ExtractedEntity], entity_type: EntityType) -> Vec<&str> {
        entities
            .iter()
            .filter(|e| e.entity_type == entity_type)
            .map(|e| e.text.as_str())
            .collect()
    }

    #[test]
    fn test_rule_based_vocabulary() {
        let extractor = RuleBasedExtractor::with_default_patterns();
        let text = "A Procurement Specialist must Approve Purchase Requisition in SAP. \
                    If the amount exceeds 10000, the Finance Team reviews the Invoice.";
        let entities = extractor.extract_text(text, Uuid::nil());

        assert!(names(&entities, EntityType::Activity).contains(&"Approve Purchase Requisition"));
        assert!(names(&entities, EntityType::Role).contains(&"Procurement Specialist"));
        assert!(names(&entities, EntityType::Role).contains(&"Finance Team"));
        assert!(names(&entities, EntityType::System).contains(&"SAP"));
        assert!(names(&entities, EntityType::Document).contains(&"Invoice"));
        assert!(names(&entities, EntityType::Decision)
            .iter()
            .any(|d| d.starts_with("If the amount exceeds")));

        let sap = entities.iter().find(|e| e.text == "SAP").unwrap();
        assert!((sap.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_role_reference_confidence() {
        let extractor = RuleBasedExtractor::with_default_patterns();
        let entities = extractor.extract_text("Forms go to the approver for sign-off.", Uuid::nil());
        let approver = entities.iter().find(|e| e.text == "approver").unwrap();
        assert_eq!(approver.entity_type, EntityType::Role);
        assert!((approver.confidence - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn test_duplicates_within_fragment_collapse() {
        let extractor = RuleBasedExtractor::with_default_patterns();
        let entities = extractor.extract_text("Use SAP daily. SAP is slow.", Uuid::nil());
        assert_eq!(names(&entities, EntityType::System), vec!["SAP"]);
    }

    #[test]
    fn test_seed_term_boost() {
        let extractor = RuleBasedExtractor::with_default_patterns().with_seed_terms(["purchase order"]);
        let entities = extractor.extract_text("Attach the Purchase Order 42 please.", Uuid::nil());
        let document = entities
            .iter()
            .find(|e| e.entity_type == EntityType::Document)
            .unwrap();
        assert_eq!(document.text, "Purchase Order 42");
        assert!((document.confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_blank_text() {
        let extractor = RuleBasedExtractor::default();
        assert!(extractor.extract_text("   \n", Uuid::nil()).is_empty());
    }

    struct FailingOn(Uuid);

    #[async_trait::async_trait]
    impl Extractor for FailingOn {
        fn strategy(&self) -> ExtractionStrategy {
            ExtractionStrategy::Scripted
        }

        async fn extract(&self, text: &str, fragment_id: Uuid) -> ExtractionResult<Vec<ExtractedEntity>> {
            if fragment_id == self.0 {
                return Err(ExtractionError::Failed("boom".into()));
            }
            if text == "slow" {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(vec![ExtractedEntity::new(fragment_id, EntityType::Activity, text, 0.9)])
        }
    }

    fn fragments(texts: &[&str]) -> Vec<EvidenceFragment> {
        let evidence_id = Uuid::now_v7();
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| EvidenceFragment::from_draft(evidence_id, i as u32, FragmentDraft::text(*t)))
            .collect()
    }

    #[tokio::test]
    async fn test_failed_fragment_is_isolated() {
        let fragments = fragments(&["Review Claims", "Approve Claims", "Close Claims"]);
        let extractor = FailingOn(fragments[0].id);

        let run = extract_fragments(Arc::new(extractor), &fragments, 2, Duration::from_secs(5)).await;

        assert_eq!(run.failures(), 1);
        assert_eq!(run.failed_fragments, vec![fragments[0].id]);
        let texts: Vec<&str> = run.entities.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["Approve Claims", "Close Claims"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let fragments = fragments(&["slow", "Close Claims"]);
        let extractor = FailingOn(Uuid::nil());

        let run = extract_fragments(Arc::new(extractor), &fragments, 4, Duration::from_secs(1)).await;

        assert_eq!(run.failed_fragments, vec![fragments[0].id]);
        assert_eq!(run.entities.len(), 1);
    }

    #[tokio::test]
    async fn test_fan_out_runs_on_spawned_task() {
        let fragments = fragments(&["Review Claims", "Approve Claims"]);
        let extractor: Arc<dyn Extractor> = Arc::new(RuleBasedExtractor::default());

        let handle = tokio::spawn(async move {
            extract_fragments(extractor, &fragments, 2, Duration::from_secs(5)).await
        });

        let run = handle.await.unwrap();
        assert_eq!(run.failures(), 0);
        assert!(!run.entities.is_empty());
    }
}
