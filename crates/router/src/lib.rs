//! The lemon routing core: run orchestration, the per-run process, the
//! output coalescers, the approvals gate, and the inbound router.
//!
//! Stateful objects are single-threaded actors (tokio tasks with mpsc
//! inboxes); cross-actor access goes through registries and the event
//! bus, never shared pointers.

pub mod adapter;
pub mod approvals;
pub mod bus;
pub mod coalescer;
pub mod gateway;
pub mod orchestrator;
pub mod outbox;
pub mod profile;
pub mod router;
pub mod run;
pub mod telegram_state;

pub use adapter::{ChannelAdapter, ChannelAdapterRegistry, GenericAdapter, TelegramAdapter};
pub use approvals::{ApprovalDecision, ApprovalOutcome, ApprovalRequest, Approvals};
pub use bus::{EventBus, LogBuffer};
pub use coalescer::{StatusCoalescers, StreamCoalescers};
pub use gateway::{EngineGateway, EngineRegistry, GatewayRun};
pub use orchestrator::RunOrchestrator;
pub use outbox::{ChannelOutbox, DeliveryNotify, MemoryOutbox};
pub use profile::{AgentProfile, AgentProfiles, SessionPolicies};
pub use router::{AgentInbox, Router, SendOptions, SessionSelector};
pub use run::{spawn_run, RunDeps};
pub use telegram_state::TelegramState;
