//! Data model for conversations, log records, and client delivery events.

pub mod conversation;
pub mod delivery;
pub mod event;
pub mod message;
pub mod validation;

pub use conversation::{
    Conversation, CreateConversationRequest, ListConversationsResponse, UpdateConversationRequest,
};
pub use delivery::{
    ConnectedPayload, DeliveryEvent, DonePayload, ErrorPayload, HeartbeatPayload,
    MessageCompletePayload, ReplayCompletePayload, TokenPayload,
};
pub use event::{ConversationEvent, EventType};
pub use message::{
    ListMessagesResponse, Message, Role, SendMessageRequest, SendMessageResponse, StreamRequest,
};
pub use validation::{Limits, ValidationError};
