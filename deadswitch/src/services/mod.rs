//! Services module
//!
//! Business logic services that coordinate between commands and repository.

pub mod attachments;
pub mod dispatcher;
pub mod evaluator;
pub mod heartbeat;
pub mod orchestrator;
pub mod reminders;
pub mod settings;
pub mod switches;
pub mod webhooks;

pub use attachments::AttachmentsService;
pub use dispatcher::{DispatchPolicy, Dispatcher, ReleasePayload, TriggerReport};
pub use evaluator::{evaluate, evaluate_switch, Evaluation};
pub use heartbeat::{HeartbeatTracker, ServiceHeartbeat};
pub use orchestrator::{Orchestrator, ReleaseOutcome, SweepReport};
pub use reminders::ReminderScheduler;
pub use settings::SettingsService;
pub use switches::{CreatedSwitch, NewSwitchRequest, SwitchService};
pub use webhooks::WebhookService;
