//! The relay core: subject naming and replay, the conversation catalog,
//! reply assembly, and per-connection delivery.

pub mod conversation_registry;
pub mod delivery;
pub mod errors;
pub mod message_service;
pub mod response_assembler;
pub mod stream_manager;

pub use conversation_registry::ConversationRegistry;
pub use delivery::{DeliveryController, DeliverySettings, DeliverySink, DeliveryState};
pub use errors::{RelayError, RelayResult};
pub use message_service::{Exchange, MessageService};
pub use response_assembler::{GenerationRequest, ResponseAssembler};
pub use stream_manager::{ReplayPage, StreamManager};
