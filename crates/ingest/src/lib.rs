//! Webhook intake: envelope parsing, duplicate suppression, per-contact
//! sequencing, persistence and the bot relay.

pub mod clock;
pub mod coordinator;
pub mod dedup;
pub mod envelope;
pub mod error;
pub mod persister;
pub mod pipeline;
pub mod relay;
pub mod resolver;
pub mod sequencer;

pub use coordinator::{IngestionCoordinator, Intake};
pub use envelope::{parse_envelope, EnvelopeError, WebhookEvent};
pub use error::IngestError;
pub use pipeline::Pipeline;
pub use relay::{BotRelay, HttpRelay, RelayError};
pub use sequencer::{Completion, Sequencer, TaskOutcome};
