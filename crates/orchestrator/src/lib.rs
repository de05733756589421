//! Saga orchestration for order fulfillment.
//!
//! The engine coordinates credit check, payment, inventory and shipping
//! capabilities over asynchronous messaging. Every inbound message is
//! dispatched to the saga instance named by its correlation key and
//! evaluated against a declarative transition table ([`StateMachine`]).
//!
//! See [`OrderState`] for the lifecycle.
//!
//! State changes and the messages they produce are committed together
//! through the outbox and handed to the transport by the [`OutboxRelay`].
//! Failures after a forward step has taken effect are undone by the
//! [`CompensationController`].

pub mod capabilities;
pub mod compensation;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod instance;
pub mod machine;
pub mod notification;
pub mod relay;
pub mod request;
pub mod retry;
pub mod state;
pub mod transport;

pub use compensation::{CompensationController, ForwardStep};
pub use config::OrchestratorConfig;
pub use engine::{Engine, IgnoreReason, Outcome};
pub use error::{EngineError, Result};
pub use host::{Delivery, SagaHost};
pub use instance::OrderSaga;
pub use machine::{Effect, StateMachine, Step, TransitionContext};
pub use notification::{InMemoryNotifier, Notification, Notifier, TracingNotifier};
pub use relay::{OutboxRelay, RelaySettings, RelayStats};
pub use request::{RequestCoordinator, RequestSlot, Resolution};
pub use retry::{RetriesExhausted, RetryExecutor};
pub use saga_store::{Backoff, RetryPolicy};
pub use state::OrderState;
pub use transport::{InMemoryBus, Transport, TransportError};
