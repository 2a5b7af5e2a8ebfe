use crate::dedup::DedupCache;
use crate::envelope::{parse_envelope, EnvelopeError, WebhookEvent};
use crate::pipeline::Pipeline;
use crate::sequencer::{Completion, Sequencer};
use chatdesk_core::config::IngestConfig;
use chatdesk_core::metrics::MetricsStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What intake did with one event of an envelope.
#[derive(Debug)]
pub enum Intake {
    Queued {
        message_id: String,
        phone: String,
        completion: Completion,
    },
    Duplicate {
        message_id: String,
    },
    StatusQueued {
        message_id: String,
        completion: Completion,
    },
}

impl Intake {
    pub fn completion(self) -> Option<Completion> {
        match self {
            Intake::Queued { completion, .. } | Intake::StatusQueued { completion, .. } => {
                Some(completion)
            }
            Intake::Duplicate { .. } => None,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Intake::Duplicate { .. })
    }
}

/// Owns the process-local intake state: the dedup cache and the per-contact
/// lanes. Build one per process and share it with the HTTP layer.
pub struct IngestionCoordinator {
    dedup: DedupCache,
    sequencer: Sequencer,
    pipeline: Arc<Pipeline>,
    metrics: Arc<MetricsStore>,
}

impl IngestionCoordinator {
    pub fn new(
        pipeline: Arc<Pipeline>,
        dedup: DedupCache,
        sequencer: Sequencer,
        metrics: Arc<MetricsStore>,
    ) -> Self {
        Self {
            dedup,
            sequencer,
            pipeline,
            metrics,
        }
    }

    pub fn from_config(
        config: &IngestConfig,
        pipeline: Arc<Pipeline>,
        metrics: Arc<MetricsStore>,
    ) -> Self {
        Self::new(
            pipeline,
            DedupCache::new(
                Duration::from_secs(config.dedup_window_secs),
                config.dedup_sweep_threshold,
            ),
            Sequencer::new(Duration::from_secs(config.lane_idle_secs)),
            metrics,
        )
    }

    /// Admit and queue every event in `envelope`. Never waits for processing.
    ///
    /// Messages are keyed by sender phone; delivery statuses by recipient when
    /// known, so they queue behind that contact's in-flight work.
    pub fn ingest(&self, envelope: Value) -> Result<Vec<Intake>, EnvelopeError> {
        let events = parse_envelope(&envelope)?;
        let envelope = Arc::new(envelope);
        let mut intakes = Vec::with_capacity(events.len());

        for event in events {
            match event {
                WebhookEvent::Message(message) => {
                    if !self.dedup.admit(&message.message_id) {
                        self.metrics.inc_duplicates_dropped();
                        info!(
                            message_id = %message.message_id,
                            phone = %message.phone,
                            "duplicate delivery ignored"
                        );
                        intakes.push(Intake::Duplicate {
                            message_id: message.message_id,
                        });
                        continue;
                    }

                    let message_id = message.message_id.clone();
                    let phone = message.phone.clone();
                    let pipeline = self.pipeline.clone();
                    let metrics = self.metrics.clone();
                    let envelope = envelope.clone();
                    let completion = self.sequencer.enqueue(&phone, async move {
                        let result = pipeline.handle_message(message, envelope).await;
                        if result.is_err() {
                            metrics.inc_tasks_failed();
                        }
                        result
                    });
                    debug!(message_id = %message_id, phone = %phone, "message queued");
                    intakes.push(Intake::Queued {
                        message_id,
                        phone,
                        completion,
                    });
                }
                WebhookEvent::Status(status) => {
                    let key = status
                        .recipient
                        .clone()
                        .unwrap_or_else(|| format!("status:{}", status.message_id));
                    let message_id = status.message_id.clone();
                    let pipeline = self.pipeline.clone();
                    let completion = self
                        .sequencer
                        .enqueue(&key, async move { pipeline.handle_status(status).await });
                    intakes.push(Intake::StatusQueued {
                        message_id,
                        completion,
                    });
                }
            }
        }

        Ok(intakes)
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// Finish every event already acknowledged to the provider. Call after the
    /// HTTP listener has stopped accepting deliveries.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let drained = self.sequencer.shutdown(timeout).await;
        if drained {
            info!("ingestion drained");
        } else {
            warn!(
                timeout_secs = timeout.as_secs(),
                "ingestion still busy at shutdown deadline"
            );
        }
        drained
    }
}
