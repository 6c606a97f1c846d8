// Outbound Sequence Engine
//
// Enrollments walk a lead's contact through an ordered list of steps. The poller
// job claims due enrollments and hands each one to the step executor; the
// enrollment API and sequence admin mutate state outside the poll cycle.

pub mod admin;
pub mod delivery;
pub mod enrollment;
pub mod error;
pub mod executor;
pub mod postgres;
pub mod store;
pub mod template;
pub mod wait_until;

pub use admin::SequenceAdmin;
pub use delivery::{EmailSender, HttpWebhookCaller, OutboundEmail, WebhookCaller};
pub use enrollment::EnrollmentService;
pub use error::{SequenceError, SequenceResult};
pub use executor::{CompletionReason, ExecutorSettings, StepExecutor, StepOutcome};
pub use postgres::PgSequenceStore;
pub use store::{EnrollmentStore, NewEmailActivity, NewEnrollment, NewSequence, Transition};
pub use template::PlaceholderRenderer;
