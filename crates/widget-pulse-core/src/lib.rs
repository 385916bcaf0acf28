use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SessionError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Transport-level dispatch failure. Distinct from a sink reply that could
/// be read but carried an error payload.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("sink transport error: {0}")]
pub struct SinkTransportError(pub String);

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`SessionError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, SessionError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| SessionError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(SessionError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`SessionError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, SessionError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            SessionError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WidgetCategory {
    Math,
    English,
    Korean,
    Social,
    Science,
    SchoolLife,
}

impl WidgetCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Math => "math",
            Self::English => "english",
            Self::Korean => "korean",
            Self::Social => "social",
            Self::Science => "science",
            Self::SchoolLife => "etc",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "math" => Some(Self::Math),
            "english" => Some(Self::English),
            "korean" => Some(Self::Korean),
            "social" => Some(Self::Social),
            "science" => Some(Self::Science),
            "etc" => Some(Self::SchoolLife),
            _ => None,
        }
    }

    /// Display label as shown on the original category cards.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Math => "수학",
            Self::English => "영어",
            Self::Korean => "국어",
            Self::Social => "사탐",
            Self::Science => "과탐",
            Self::SchoolLife => "학교 생활",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
pub struct WidgetEntry {
    pub page_id: &'static str,
    pub title: &'static str,
    pub numeric_id: u32,
    pub category: WidgetCategory,
}

/// Sentinel returned for page ids with no catalog entry. Distinguishable
/// from every real id, which all live in per-category hundred bands.
pub const UNKNOWN_WIDGET_ID: u32 = 9999;

const fn entry(
    page_id: &'static str,
    title: &'static str,
    numeric_id: u32,
    category: WidgetCategory,
) -> WidgetEntry {
    WidgetEntry {
        page_id,
        title,
        numeric_id,
        category,
    }
}

const WIDGET_CATALOG: &[WidgetEntry] = &[
    entry("math-helper", "수학풀이 도우미", 101, WidgetCategory::Math),
    entry("math-formula-cards", "공식암기 카드", 102, WidgetCategory::Math),
    entry("graph-visualizer", "그래프 시각화", 103, WidgetCategory::Math),
    entry("wrong-answer-generator", "오답노트 자동 생성기", 104, WidgetCategory::Math),
    entry("integral-graph", "적분 그래프 시각화", 105, WidgetCategory::Math),
    entry("limit-simulator", "극한 시뮬레이터", 106, WidgetCategory::Math),
    entry("probability-simulator", "확률 시뮬레이터", 107, WidgetCategory::Math),
    entry("normal-distribution", "정규분포 계산기", 108, WidgetCategory::Math),
    entry("sequence-helper", "수열 도우미", 109, WidgetCategory::Math),
    entry("set-proposition-quiz", "집합 명제 퀴즈", 110, WidgetCategory::Math),
    entry("trigonometry-visualizer", "삼각비 시각화", 111, WidgetCategory::Math),
    entry("english-essay", "영어 에세이 첨삭", 201, WidgetCategory::English),
    entry("essay-helper", "에세이 첨삭 도우미", 202, WidgetCategory::English),
    entry("pronunciation-trainer", "발음 교정기", 203, WidgetCategory::English),
    entry("reading-summarizer", "독해 요약 훈련", 204, WidgetCategory::English),
    entry("conversation-chatbot", "영어 회화 챗봇", 205, WidgetCategory::English),
    entry("text-summarizer", "비문학 지문 요약기", 301, WidgetCategory::Korean),
    entry("literature-analyzer", "문학작품 해석", 302, WidgetCategory::Korean),
    entry("vocabulary-cards", "어휘 학습 카드", 303, WidgetCategory::Korean),
    entry("writing-corrector", "작문 첨삭", 304, WidgetCategory::Korean),
    entry("classical-literature", "고전 문학 풀이", 305, WidgetCategory::Korean),
    entry("sentence-analyzer", "구문 분석기", 306, WidgetCategory::Korean),
    entry("timeline-generator", "연표 생성기", 401, WidgetCategory::Social),
    entry("concept-comparator", "개념 비교표", 402, WidgetCategory::Social),
    entry("real-world-connector", "현실세계 개념 연동", 403, WidgetCategory::Social),
    entry("map-interpreter", "지도 해석 훈련", 404, WidgetCategory::Social),
    entry("person-event-matching", "인물사건 매칭 퀴즈", 405, WidgetCategory::Social),
    entry("historical-source-interpreter", "사료 해석기", 406, WidgetCategory::Social),
    entry("cultural-heritage-guide", "시대별 문화재 도감", 407, WidgetCategory::Social),
    entry("ethics-philosopher-cards", "윤리 사상가 카드", 408, WidgetCategory::Social),
    entry("ideology-comparison", "사상 비교표", 409, WidgetCategory::Social),
    entry("ethics-dilemma-discussion", "윤리 딜레마 토론", 410, WidgetCategory::Social),
    entry("social-constitution-summary-cards", "헌법 요약 카드", 411, WidgetCategory::Social),
    entry("precedent-learner", "판례 학습기", 412, WidgetCategory::Social),
    entry("political-system-comparison", "정치제도 비교표", 413, WidgetCategory::Social),
    entry("law-simulator", "법칙 시뮬레이터", 501, WidgetCategory::Science),
    entry("virtual-experiment", "가상 실험 체험", 502, WidgetCategory::Science),
    entry("electric-circuit-sim", "전기 회로 시뮬레이터", 503, WidgetCategory::Science),
    entry("optics-simulator", "광학 시뮬레이터", 504, WidgetCategory::Science),
    entry("celestial-simulator", "천체 시뮬레이터", 505, WidgetCategory::Science),
    entry("volcano-simulator", "화산 시뮬레이터", 506, WidgetCategory::Science),
    entry("mineral-guide", "광물 도감", 507, WidgetCategory::Science),
    entry("space-exploration-timeline", "우주 탐사 연대표", 508, WidgetCategory::Science),
    entry("cell-3d-viewer", "세포 구조 3D 뷰어", 509, WidgetCategory::Science),
    entry("human-body-simulator", "인체 시스템 시뮬레이터", 510, WidgetCategory::Science),
    entry("taxonomy-quiz", "계통도 퀴즈", 511, WidgetCategory::Science),
    entry("chemical-formula-completer", "화학식 자동 완성기", 512, WidgetCategory::Science),
    entry("periodic-table-explorer", "주기율표 탐색기", 513, WidgetCategory::Science),
    entry("conversation-practice", "친구와 대화 연습하기", 601, WidgetCategory::SchoolLife),
    entry("mental-care", "멘탈케어 위젯", 602, WidgetCategory::SchoolLife),
    entry("webtoon-ideas", "웹툰 아이디어 봇", 603, WidgetCategory::SchoolLife),
    entry("video-script", "영상 시나리오 작성기", 604, WidgetCategory::SchoolLife),
    entry("rap-lyrics", "랩 가사 도우미", 605, WidgetCategory::SchoolLife),
    entry("art-design", "그림 디자인 봇", 606, WidgetCategory::SchoolLife),
    entry("birthday-reminder", "친구 생일 알림", 607, WidgetCategory::SchoolLife),
    entry("emotion-diary", "감정기록 다이어리", 608, WidgetCategory::SchoolLife),
    entry("motivation-messages", "동기부여 메시지", 609, WidgetCategory::SchoolLife),
    entry("stress-relief", "스트레스 해소 챌린지", 610, WidgetCategory::SchoolLife),
];

#[must_use]
pub fn widget_catalog() -> &'static [WidgetEntry] {
    WIDGET_CATALOG
}

#[must_use]
pub fn widget_entry(page_id: &str) -> Option<&'static WidgetEntry> {
    WIDGET_CATALOG.iter().find(|entry| entry.page_id == page_id)
}

/// Resolves a page id to its numeric widget id, falling back to
/// [`UNKNOWN_WIDGET_ID`] for slugs outside the catalog.
#[must_use]
pub fn numeric_widget_id(page_id: &str) -> u32 {
    widget_entry(page_id).map_or(UNKNOWN_WIDGET_ID, |entry| entry.numeric_id)
}

#[must_use]
pub fn widgets_in_category(category: WidgetCategory) -> Vec<&'static WidgetEntry> {
    WIDGET_CATALOG
        .iter()
        .filter(|entry| entry.category == category)
        .collect()
}

/// Current canonical persisted-profile shape version.
pub const PROFILE_SCHEMA_VERSION: u32 = 2;

pub const CANONICAL_PROFILE_SLOT: &str = "profile_record";
pub const LEGACY_NAME_SLOT: &str = "user_name";
pub const LEGACY_GRADE_SLOT: &str = "user_grade";
pub const LEGACY_PHONE_SLOT: &str = "user_phone";
pub const LEGACY_USER_ID_SLOT: &str = "user_id";
pub const LEGACY_REGISTERED_SLOT: &str = "has_registered";

/// Every slot key the identity store is known to use; `reset` clears all
/// of them.
pub const ALL_PROFILE_SLOTS: &[&str] = &[
    CANONICAL_PROFILE_SLOT,
    LEGACY_NAME_SLOT,
    LEGACY_GRADE_SLOT,
    LEGACY_PHONE_SLOT,
    LEGACY_USER_ID_SLOT,
    LEGACY_REGISTERED_SLOT,
];

const LEGACY_PROFILE_SLOTS: &[&str] = &[
    LEGACY_NAME_SLOT,
    LEGACY_GRADE_SLOT,
    LEGACY_PHONE_SLOT,
    LEGACY_USER_ID_SLOT,
    LEGACY_REGISTERED_SLOT,
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityRecord {
    pub user_id: String,
    pub name: String,
    pub grade: String,
    pub phone: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl IdentityRecord {
    /// A record authorizes feedback emission only when both required
    /// profile fields are present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.name.trim().is_empty() && !self.grade.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedProfile {
    schema_version: u32,
    #[serde(default)]
    user_id: String,
    name: String,
    grade: String,
    #[serde(default)]
    phone: String,
    created_at: String,
}

fn rolling_hash(input: &str) -> u32 {
    input
        .chars()
        .fold(0_u32, |hash, ch| hash.wrapping_mul(31).wrapping_add(u32::from(ch)))
}

/// Derives a visitor identifier from the registration inputs.
///
/// The hash prefixes keep the id human-traceable to its name/grade inputs;
/// the ULID suffix carries the creation instant plus randomness, so every
/// draw is unique even for identical inputs. No collision resistance is
/// claimed. Empty inputs hash to zero rather than failing.
#[must_use]
pub fn derive_user_id(name: &str, grade: &str) -> String {
    let token = Ulid::new().to_string().to_lowercase();
    format!("u{:08x}{:08x}{token}", rolling_hash(name), rolling_hash(grade))
}

/// Durable, reload-surviving slot storage scoped to one profile.
pub trait ProfileSlots {
    /// # Errors
    /// Returns [`SessionError::Storage`] when the backend cannot be read.
    fn read_slot(&self, key: &str) -> Result<Option<String>, SessionError>;

    /// # Errors
    /// Returns [`SessionError::Storage`] when the backend cannot be written.
    fn write_slot(&mut self, key: &str, value: &str) -> Result<(), SessionError>;

    /// # Errors
    /// Returns [`SessionError::Storage`] when the backend cannot be written.
    fn remove_slot(&mut self, key: &str) -> Result<(), SessionError>;
}

/// In-memory slot storage for tests and runs without a durable backend.
#[derive(Debug, Default, Clone)]
pub struct MemoryProfileSlots {
    slots: BTreeMap<String, String>,
}

impl MemoryProfileSlots {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProfileSlots for MemoryProfileSlots {
    fn read_slot(&self, key: &str) -> Result<Option<String>, SessionError> {
        Ok(self.slots.get(key).cloned())
    }

    fn write_slot(&mut self, key: &str, value: &str) -> Result<(), SessionError> {
        self.slots.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_slot(&mut self, key: &str) -> Result<(), SessionError> {
        self.slots.remove(key);
        Ok(())
    }
}

/// Produces, persists, and validates at most one identity per storage
/// scope. Constructed explicitly by the application controller and passed
/// to whatever needs identity; there is no ambient singleton.
#[derive(Debug)]
pub struct IdentityStore<S> {
    slots: S,
    record: Option<IdentityRecord>,
    initialized: bool,
    ephemeral_session_id: String,
}

impl<S: ProfileSlots> IdentityStore<S> {
    pub fn new(slots: S) -> Self {
        Self {
            slots,
            record: None,
            initialized: false,
            ephemeral_session_id: Ulid::new().to_string().to_lowercase(),
        }
    }

    /// Loads the persisted identity, upgrading legacy shapes on the way.
    ///
    /// Never raises: a storage failure or corrupt payload degrades to
    /// "no identity" and is logged.
    pub fn initialize(&mut self) {
        self.initialized = true;
        self.record = match self.resolve_persisted() {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(error = %err, "profile storage unavailable; continuing without identity");
                None
            }
        };
    }

    fn resolve_persisted(&mut self) -> Result<Option<IdentityRecord>, SessionError> {
        if let Some(raw) = self.slots.read_slot(CANONICAL_PROFILE_SLOT)? {
            match parse_persisted_profile(&raw) {
                Ok(mut record) => {
                    if record.user_id.trim().is_empty() {
                        // Legacy canonical shape predating user ids: the one
                        // derivation outside of registration.
                        record.user_id = derive_user_id(&record.name, &record.grade);
                        if let Err(err) = self.persist(&record) {
                            tracing::warn!(error = %err, "failed to rewrite upgraded profile record");
                        }
                    }
                    return Ok(Some(record));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "canonical profile record is corrupt; trying legacy slots");
                }
            }
        }

        let name = self.slots.read_slot(LEGACY_NAME_SLOT)?.unwrap_or_default();
        let grade = self.slots.read_slot(LEGACY_GRADE_SLOT)?.unwrap_or_default();
        if name.trim().is_empty() || grade.trim().is_empty() {
            return Ok(None);
        }

        let phone = self.slots.read_slot(LEGACY_PHONE_SLOT)?.unwrap_or_default();
        let user_id = match self.slots.read_slot(LEGACY_USER_ID_SLOT)? {
            Some(id) if !id.trim().is_empty() => id,
            _ => derive_user_id(&name, &grade),
        };

        let record = IdentityRecord {
            user_id,
            name,
            grade,
            phone,
            created_at: now_utc(),
        };

        self.persist(&record)?;
        for slot in LEGACY_PROFILE_SLOTS {
            self.slots.remove_slot(slot)?;
        }

        tracing::debug!(user_id = %record.user_id, "migrated legacy profile slots to canonical record");
        Ok(Some(record))
    }

    /// Creates and persists a fresh identity, replacing any prior record.
    ///
    /// A storage-write failure is logged but does not prevent returning the
    /// in-memory record; the session can still run to end of life.
    ///
    /// # Errors
    /// Returns [`SessionError::Validation`] when `name` or `grade` is empty.
    pub fn register(
        &mut self,
        name: &str,
        grade: &str,
        phone: Option<&str>,
    ) -> Result<IdentityRecord, SessionError> {
        if name.trim().is_empty() || grade.trim().is_empty() {
            return Err(SessionError::Validation(
                "name and grade are required to register".to_string(),
            ));
        }

        let record = IdentityRecord {
            user_id: derive_user_id(name, grade),
            name: name.to_string(),
            grade: grade.to_string(),
            phone: phone.unwrap_or_default().to_string(),
            created_at: now_utc(),
        };

        if let Err(err) = self.persist(&record) {
            tracing::warn!(error = %err, "failed to persist profile record; identity kept in memory only");
        }

        self.initialized = true;
        self.record = Some(record.clone());
        Ok(record)
    }

    /// The current identity, loading persisted state on first access.
    pub fn current(&mut self) -> Option<&IdentityRecord> {
        if !self.initialized {
            self.initialize();
        }
        self.record.as_ref()
    }

    /// The single authorization gate for emitting feedback events.
    pub fn is_valid(&mut self) -> bool {
        self.current().is_some_and(IdentityRecord::is_complete)
    }

    /// Clears the in-memory record and every persisted slot key. Explicit
    /// debugging/testing re-entry only, not part of the normal flow.
    ///
    /// # Errors
    /// Returns [`SessionError::Storage`] when a slot cannot be removed.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        self.record = None;
        self.initialized = true;
        for slot in ALL_PROFILE_SLOTS {
            self.slots.remove_slot(slot)?;
        }
        Ok(())
    }

    /// Diagnostic correlation value for this construction only; never
    /// persisted as the identity key.
    #[must_use]
    pub fn ephemeral_session_id(&self) -> &str {
        &self.ephemeral_session_id
    }

    pub fn into_inner(self) -> S {
        self.slots
    }

    fn persist(&mut self, record: &IdentityRecord) -> Result<(), SessionError> {
        let payload = encode_persisted_profile(record)?;
        self.slots.write_slot(CANONICAL_PROFILE_SLOT, &payload)
    }
}

fn encode_persisted_profile(record: &IdentityRecord) -> Result<String, SessionError> {
    let payload = PersistedProfile {
        schema_version: PROFILE_SCHEMA_VERSION,
        user_id: record.user_id.clone(),
        name: record.name.clone(),
        grade: record.grade.clone(),
        phone: record.phone.clone(),
        created_at: format_rfc3339(record.created_at)?,
    };

    serde_json::to_string(&payload)
        .map_err(|err| SessionError::Storage(format!("failed to encode profile record: {err}")))
}

fn parse_persisted_profile(raw: &str) -> Result<IdentityRecord, SessionError> {
    let payload: PersistedProfile = serde_json::from_str(raw)
        .map_err(|err| SessionError::Storage(format!("invalid profile record JSON: {err}")))?;

    if payload.name.trim().is_empty() || payload.grade.trim().is_empty() {
        return Err(SessionError::Storage(
            "profile record missing name or grade".to_string(),
        ));
    }

    let created_at = parse_rfc3339_utc(&payload.created_at)?;

    Ok(IdentityRecord {
        user_id: payload.user_id,
        name: payload.name,
        grade: payload.grade,
        phone: payload.phone,
        created_at,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SurveyResponses {
    pub frequency: String,
    pub helpfulness: String,
    pub need: String,
}

impl SurveyResponses {
    /// Validates that all three survey questions were answered.
    ///
    /// # Errors
    /// Returns [`SessionError::Validation`] when any answer is empty.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.frequency.trim().is_empty()
            || self.helpfulness.trim().is_empty()
            || self.need.trim().is_empty()
        {
            return Err(SessionError::Validation(
                "all three survey questions must be answered".to_string(),
            ));
        }
        Ok(())
    }
}

/// `Type` field value distinguishing feedback events; registration events
/// carry no `Type` field.
pub const FEEDBACK_TYPE_TAG: &str = "Survey";

#[must_use]
pub fn source_tag_for(widget_numeric_id: u32) -> String {
    format!("widget-{widget_numeric_id}")
}

/// Transient outbound message; exists only for one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    Registration {
        user_id: String,
        name: String,
        grade: String,
        phone: String,
        timestamp: OffsetDateTime,
    },
    Feedback {
        user_id: String,
        widget_numeric_id: u32,
        widget_title: String,
        name: String,
        grade: String,
        responses: SurveyResponses,
        timestamp: OffsetDateTime,
        source_tag: String,
    },
}

impl OutboundEvent {
    /// Encodes the event as the sink's form fields.
    ///
    /// # Errors
    /// Returns [`SessionError::Validation`] when the timestamp cannot be
    /// formatted.
    pub fn form_fields(&self) -> Result<Vec<(String, String)>, SessionError> {
        match self {
            Self::Registration {
                user_id,
                name,
                grade,
                phone,
                timestamp,
            } => Ok(vec![
                ("UserId".to_string(), user_id.clone()),
                ("Name".to_string(), name.clone()),
                ("Grade".to_string(), grade.clone()),
                ("Phone".to_string(), phone.clone()),
                ("Timestamp".to_string(), format_rfc3339(*timestamp)?),
            ]),
            Self::Feedback {
                user_id,
                widget_numeric_id,
                widget_title,
                name,
                grade,
                responses,
                timestamp,
                source_tag,
            } => Ok(vec![
                ("Type".to_string(), FEEDBACK_TYPE_TAG.to_string()),
                ("UserId".to_string(), user_id.clone()),
                ("WidgetId".to_string(), widget_numeric_id.to_string()),
                ("WidgetTitle".to_string(), widget_title.clone()),
                ("Name".to_string(), name.clone()),
                ("Grade".to_string(), grade.clone()),
                ("Frequency".to_string(), responses.frequency.clone()),
                ("Helpfulness".to_string(), responses.helpfulness.clone()),
                ("Need".to_string(), responses.need.clone()),
                ("Timestamp".to_string(), format_rfc3339(*timestamp)?),
                ("Source".to_string(), source_tag.clone()),
            ]),
        }
    }
}

/// External HTTP sink boundary. Implementations return the raw reply body;
/// classification happens in [`parse_sink_reply`].
pub trait EventSink {
    /// # Errors
    /// Returns [`SinkTransportError`] only for transport-level failures; a
    /// readable reply with an error payload is still an `Ok` body.
    fn dispatch(&self, fields: &[(String, String)]) -> Result<String, SinkTransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkReply {
    Success { detail: Option<String> },
    Error { message: String },
    Unparsed { raw: String },
}

/// Classifies a sink reply body. A body that parses as JSON is honored via
/// its `result` field; anything else (an HTML error page, say) is an
/// unparsed reply, distinct from a transport failure.
#[must_use]
pub fn parse_sink_reply(body: &str) -> SinkReply {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return SinkReply::Unparsed {
            raw: body.to_string(),
        };
    };

    match value.get("result").and_then(Value::as_str) {
        Some("success") => SinkReply::Success {
            detail: value.get("row").map(std::string::ToString::to_string),
        },
        Some("error") => SinkReply::Error {
            message: value
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(
                    || "sink reported an unspecified error".to_string(),
                    str::to_string,
                ),
        },
        _ => SinkReply::Unparsed {
            raw: body.to_string(),
        },
    }
}

/// Settled result of one dispatch attempt. Every variant resolves the
/// caller's completion; the feedback UI dismisses on any of them.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Accepted {
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Rejected {
        message: String,
    },
    UnparsedReply {
        raw: String,
    },
    TransportFailed {
        message: String,
    },
}

impl DispatchOutcome {
    #[must_use]
    pub fn delivered(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Builds and dispatches the two event kinds, tagged with the current
/// identity, decoupled from the identity store's internal shape.
#[derive(Debug)]
pub struct EventCorrelator<S> {
    sink: S,
}

impl<S: EventSink> EventCorrelator<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    /// Announces a new or replaced identity to the sink. Fire-and-forget:
    /// the identity is already durable and the registration prompt must not
    /// reappear, so every dispatch outcome is logged rather than surfaced.
    pub fn emit_registration(&self, record: &IdentityRecord) {
        let event = OutboundEvent::Registration {
            user_id: record.user_id.clone(),
            name: record.name.clone(),
            grade: record.grade.clone(),
            phone: record.phone.clone(),
            timestamp: now_utc(),
        };

        match self.dispatch_event(&event) {
            Ok(DispatchOutcome::Accepted { detail }) => {
                tracing::debug!(user_id = %record.user_id, ?detail, "registration event accepted by sink");
            }
            Ok(outcome) => {
                tracing::warn!(user_id = %record.user_id, ?outcome, "registration event was not recorded by the sink");
            }
            Err(err) => {
                tracing::warn!(user_id = %record.user_id, error = %err, "registration event could not be encoded");
            }
        }
    }

    /// Dispatches one per-widget feedback event tagged with the identity
    /// and a source tag derived from the resolved numeric widget id.
    ///
    /// Preconditions are checked before any network call; a settled
    /// dispatch (delivered or not) is always `Ok` so the caller can decide
    /// when to dismiss its UI.
    ///
    /// # Errors
    /// Returns [`SessionError::Validation`] when the identity is missing or
    /// incomplete, or when any of the three survey answers is empty.
    pub fn emit_feedback(
        &self,
        identity: Option<&IdentityRecord>,
        page_id: &str,
        widget_title: &str,
        responses: &SurveyResponses,
    ) -> Result<DispatchOutcome, SessionError> {
        let Some(record) = identity.filter(|record| record.is_complete()) else {
            return Err(SessionError::Validation(
                "no valid identity; complete registration before submitting feedback".to_string(),
            ));
        };

        responses.validate()?;

        let widget_numeric_id = numeric_widget_id(page_id);
        let event = OutboundEvent::Feedback {
            user_id: record.user_id.clone(),
            widget_numeric_id,
            widget_title: widget_title.to_string(),
            name: record.name.clone(),
            grade: record.grade.clone(),
            responses: responses.clone(),
            timestamp: now_utc(),
            source_tag: source_tag_for(widget_numeric_id),
        };

        self.dispatch_event(&event)
    }

    fn dispatch_event(&self, event: &OutboundEvent) -> Result<DispatchOutcome, SessionError> {
        let fields = event.form_fields()?;

        match self.sink.dispatch(&fields) {
            Ok(body) => Ok(match parse_sink_reply(&body) {
                SinkReply::Success { detail } => DispatchOutcome::Accepted { detail },
                SinkReply::Error { message } => {
                    tracing::warn!(%message, "sink rejected event");
                    DispatchOutcome::Rejected { message }
                }
                SinkReply::Unparsed { raw } => {
                    tracing::warn!(raw_reply = %raw, "sink reply was not structured data");
                    DispatchOutcome::UnparsedReply { raw }
                }
            }),
            Err(err) => {
                tracing::warn!(error = %err, "event dispatch failed in transport");
                Ok(DispatchOutcome::TransportFailed {
                    message: err.to_string(),
                })
            }
        }
    }
}
