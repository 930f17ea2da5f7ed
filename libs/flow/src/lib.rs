//! Conversational ordering flow.
//!
//! The engine is a pure consumer of the store and the catalog: every inbound
//! loads the conversation's flow snapshot, applies one transition, persists
//! the snapshot, and emits outbound sends through [`OutboundEnqueuer`].

pub mod buttons;
pub mod engine;
pub mod enqueue;
pub mod matchers;
pub mod state;
pub mod submit;

pub use buttons::{handle_button_click, VIEW_ORDER};
pub use engine::{FlowEngine, FlowError, InboundContext};
pub use enqueue::{OutboundEnqueuer, RecordingEnqueuer, SharedEnqueuer};
pub use state::{FlowRecord, FlowState, PendingItem};
pub use submit::{
    HttpOrderApi, InMemoryOrderApi, OrderApi, OrderSubmission, OrderSubmitError, SharedOrderApi,
};
