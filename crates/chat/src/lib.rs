#![deny(unsafe_code)]

//! Conversation engine for the Maitri health chat.
//!
//! [`ConversationStore`] owns every conversation and enforces the transcript invariants;
//! [`ChatController`] turns user intents into store operations and runs the assistant
//! calls they admit.

pub mod controller;
pub mod error;
pub mod ids;
pub mod message;
pub mod store;

pub use controller::{ChatController, ChatEvent, ReplyHandle};
pub use error::{ChatError, ChatResult};
pub use ids::{ConversationId, IdGenerator, MessageId, RandomIds, RequestId, SequentialIds};
pub use message::{
    Conversation, DEFAULT_CONVERSATION_TITLE, FALLBACK_REPLY_TEXT, GREETING_TEXT,
    INITIAL_CONVERSATION_TITLE, Message, Role, TITLE_ELLIPSIS, TITLE_MAX_CHARS, derive_title,
};
pub use store::{
    Admission, BusyScope, ChatOptions, ConversationStore, EditDraft, PendingReply, Rejection,
    SettledReply,
};
