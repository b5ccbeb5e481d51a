//! Human feedback intake.
//!
//! The one narrow write path into a completed run: raters attach a rating,
//! error spans, missing-source hints or a corrected text. Events are
//! additive and never touch the audit record; the summary is a pure fold
//! over the event multiset, so aggregation order cannot matter.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::audit::AuditStore;
use crate::error::{EngineError, Result};

/// An offset range the rater flagged as wrong, with a correction hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSpan {
    pub start: usize,
    pub end: usize,
    pub label: String,
    pub suggestion: Option<String>,
}

/// A source the rater says should have been used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingSource {
    /// Raw citation string, e.g. "STJ REsp 1234567/SP".
    pub raw: String,
    pub classification: Option<String>,
    pub relevance: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub run_id: Uuid,
    pub rater_id: String,
    /// −1, 0 or +1.
    pub rating: i8,
    pub comment: Option<String>,
    #[serde(default)]
    pub error_spans: Vec<ErrorSpan>,
    #[serde(default)]
    pub missing_sources: Vec<MissingSource>,
    pub edited_text: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// An accepted feedback event. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub id: Uuid,
    pub run_id: Uuid,
    pub rater_id: String,
    pub rating: i8,
    pub comment: Option<String>,
    pub error_spans: Vec<ErrorSpan>,
    pub missing_sources: Vec<MissingSource>,
    pub edited_text: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate view over all events of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackSummary {
    pub run_id: Uuid,
    pub events: usize,
    pub mean_rating: f64,
    pub total_error_spans: usize,
    pub distinct_missing_sources: usize,
    /// Tag multiset.
    pub tags: BTreeMap<String, usize>,
}

/// Persistence boundary for feedback events; one row per event.
#[async_trait]
pub trait FeedbackStore: Send + Sync {
    async fn append(&self, event: FeedbackEvent) -> Result<()>;
    async fn for_run(&self, run_id: Uuid) -> Result<Vec<FeedbackEvent>>;
}

#[derive(Default)]
pub struct InMemoryFeedbackStore {
    events: tokio::sync::RwLock<HashMap<Uuid, Vec<FeedbackEvent>>>,
}

impl InMemoryFeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeedbackStore for InMemoryFeedbackStore {
    async fn append(&self, event: FeedbackEvent) -> Result<()> {
        self.events
            .write()
            .await
            .entry(event.run_id)
            .or_default()
            .push(event);
        Ok(())
    }

    async fn for_run(&self, run_id: Uuid) -> Result<Vec<FeedbackEvent>> {
        Ok(self
            .events
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}

pub struct FeedbackIntake {
    audit: Arc<dyn AuditStore>,
    store: Arc<dyn FeedbackStore>,
}

impl FeedbackIntake {
    pub fn new(audit: Arc<dyn AuditStore>, store: Arc<dyn FeedbackStore>) -> Self {
        Self { audit, store }
    }

    /// Validate and store one feedback event. The run must exist and be
    /// terminated; anything else is rejected at the boundary.
    pub async fn submit(&self, request: FeedbackRequest) -> Result<FeedbackEvent> {
        if !matches!(request.rating, -1 | 0 | 1) {
            return Err(EngineError::InputInvalid(format!(
                "rating must be -1, 0 or 1, got {}",
                request.rating
            )));
        }
        for span in &request.error_spans {
            if span.end <= span.start {
                return Err(EngineError::InputInvalid(format!(
                    "error span [{}, {}) is empty or inverted",
                    span.start, span.end
                )));
            }
        }

        let record = self
            .audit
            .fetch(request.run_id, &request.rater_id, "feedback validation")
            .await
            .map_err(|e| EngineError::AuditWriteFailed(e.to_string()))?
            .ok_or_else(|| {
                EngineError::InputInvalid(format!("run {} does not exist", request.run_id))
            })?;
        if !record.status.is_terminal() {
            return Err(EngineError::InputInvalid(format!(
                "run {} has not terminated",
                request.run_id
            )));
        }

        let event = FeedbackEvent {
            id: Uuid::new_v4(),
            run_id: request.run_id,
            rater_id: request.rater_id,
            rating: request.rating,
            comment: request.comment,
            error_spans: request.error_spans,
            missing_sources: request.missing_sources,
            edited_text: request.edited_text,
            tags: request.tags,
            created_at: Utc::now(),
        };

        info!(
            target: "feedback",
            run_id = %event.run_id,
            rater = %event.rater_id,
            rating = event.rating,
            spans = event.error_spans.len(),
            "Feedback event accepted"
        );

        self.store.append(event.clone()).await?;
        Ok(event)
    }

    /// Aggregate all events for a run. Depends only on the event multiset.
    pub async fn summary(&self, run_id: Uuid) -> Result<FeedbackSummary> {
        let events = self.store.for_run(run_id).await?;
        Ok(summarise(run_id, &events))
    }
}

fn summarise(run_id: Uuid, events: &[FeedbackEvent]) -> FeedbackSummary {
    let mut tags: BTreeMap<String, usize> = BTreeMap::new();
    let mut distinct_sources: std::collections::BTreeSet<&str> = Default::default();
    let mut total_spans = 0usize;
    let mut rating_sum = 0i64;

    for event in events {
        rating_sum += i64::from(event.rating);
        total_spans += event.error_spans.len();
        for source in &event.missing_sources {
            distinct_sources.insert(source.raw.as_str());
        }
        for tag in &event.tags {
            *tags.entry(tag.clone()).or_default() += 1;
        }
    }

    FeedbackSummary {
        run_id,
        events: events.len(),
        mean_rating: if events.is_empty() {
            0.0
        } else {
            rating_sum as f64 / events.len() as f64
        },
        total_error_spans: total_spans,
        distinct_missing_sources: distinct_sources.len(),
        tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditRecorder, InMemoryAuditStore};
    use crate::engine::testing::blank_state;
    use crate::state::RunStatus;

    async fn sealed_run(store: &Arc<InMemoryAuditStore>) -> Uuid {
        let recorder = AuditRecorder::new(Arc::clone(store) as Arc<dyn AuditStore>);
        let state = blank_state("T1", "consulta");
        recorder
            .seal(&state, RunStatus::Succeeded, Some("texto"), None)
            .await
            .unwrap();
        state.run_id
    }

    fn request(run_id: Uuid, rating: i8) -> FeedbackRequest {
        FeedbackRequest {
            run_id,
            rater_id: "adv-1".into(),
            rating,
            comment: None,
            error_spans: vec![],
            missing_sources: vec![],
            edited_text: None,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn rejects_unknown_run() {
        let audit = Arc::new(InMemoryAuditStore::new());
        let intake = FeedbackIntake::new(audit, Arc::new(InMemoryFeedbackStore::new()));
        let err = intake.submit(request(Uuid::new_v4(), 1)).await.unwrap_err();
        assert_eq!(err.kind(), "input_invalid");
    }

    #[tokio::test]
    async fn rejects_out_of_range_rating_and_bad_spans() {
        let audit = Arc::new(InMemoryAuditStore::new());
        let run_id = sealed_run(&audit).await;
        let intake = FeedbackIntake::new(audit, Arc::new(InMemoryFeedbackStore::new()));

        assert!(intake.submit(request(run_id, 2)).await.is_err());

        let mut bad_span = request(run_id, 1);
        bad_span.error_spans.push(ErrorSpan {
            start: 10,
            end: 10,
            label: "vazio".into(),
            suggestion: None,
        });
        assert!(intake.submit(bad_span).await.is_err());
    }

    #[tokio::test]
    async fn events_accumulate_and_summary_is_multiset_only() {
        let audit = Arc::new(InMemoryAuditStore::new());
        let run_id = sealed_run(&audit).await;
        let intake = FeedbackIntake::new(audit, Arc::new(InMemoryFeedbackStore::new()));

        let mut first = request(run_id, 1);
        first.tags = vec!["jurisprudencia".into()];
        first.missing_sources.push(MissingSource {
            raw: "STJ REsp 1234567/SP".into(),
            classification: Some("jurisprudencia".into()),
            relevance: Some(0.95),
        });

        let mut second = request(run_id, -1);
        second.tags = vec!["jurisprudencia".into(), "formatacao".into()];
        second.error_spans.push(ErrorSpan {
            start: 10,
            end: 30,
            label: "fundamentacao_incompleta".into(),
            suggestion: Some("citar art. 186 CC".into()),
        });
        second.missing_sources.push(MissingSource {
            raw: "STJ REsp 1234567/SP".into(),
            classification: None,
            relevance: None,
        });

        intake.submit(first).await.unwrap();
        intake.submit(second).await.unwrap();

        let summary = intake.summary(run_id).await.unwrap();
        assert_eq!(summary.events, 2);
        assert!((summary.mean_rating - 0.0).abs() < f64::EPSILON);
        assert_eq!(summary.total_error_spans, 1);
        // The same raw citation counts once.
        assert_eq!(summary.distinct_missing_sources, 1);
        assert_eq!(summary.tags["jurisprudencia"], 2);
        assert_eq!(summary.tags["formatacao"], 1);
    }

    #[test]
    fn summary_is_commutative_over_events() {
        let run_id = Uuid::new_v4();
        let mk = |rating: i8, tag: &str| FeedbackEvent {
            id: Uuid::new_v4(),
            run_id,
            rater_id: "r".into(),
            rating,
            comment: None,
            error_spans: vec![],
            missing_sources: vec![],
            edited_text: None,
            tags: vec![tag.to_string()],
            created_at: Utc::now(),
        };
        let a = mk(1, "x");
        let b = mk(-1, "y");
        let c = mk(0, "x");

        let forward = summarise(run_id, &[a.clone(), b.clone(), c.clone()]);
        let backward = summarise(run_id, &[c, b, a]);
        assert_eq!(forward.mean_rating, backward.mean_rating);
        assert_eq!(forward.tags, backward.tags);
        assert_eq!(
            forward.distinct_missing_sources,
            backward.distinct_missing_sources
        );
    }
}
