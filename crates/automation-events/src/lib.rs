//! Event bus, Durable-Step Runtime, realtime pub/sub, and notifications.

pub mod bus;
pub mod notifications;
pub mod policy;
pub mod realtime;
pub mod step;

pub use bus::{EventBus, InMemoryEventBus, OutboundEvent};
pub use policy::StepPolicy;
pub use realtime::{RealtimePublisher, RealtimeUpdate};
pub use step::StepContext;
