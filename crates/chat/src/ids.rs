use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use uuid::Uuid;

use super::error::{ChatError, ChatResult, InvalidIdSnafu};

// One macro for every id wrapper so they cannot drift apart.
macro_rules! define_chat_id {
    ($name:ident, $id_type:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub const fn new(raw: Uuid) -> Self {
                Self(raw)
            }

            pub fn parse(raw: &str) -> ChatResult<Self> {
                let parsed = Uuid::parse_str(raw.trim()).context(InvalidIdSnafu {
                    stage: "parse-chat-id",
                    id_type: $id_type,
                    raw: raw.to_string(),
                })?;
                Ok(Self(parsed))
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = ChatError;

            fn from_str(raw: &str) -> ChatResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_chat_id!(ConversationId, "conversation-id");
define_chat_id!(MessageId, "message-id");

/// Tag for one assistant call. A new value is minted for every send, edit-save and
/// regenerate so a reply can only settle the slot it was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Source of raw identifiers for conversations and messages.
pub trait IdGenerator: Send {
    fn next_uuid(&mut self) -> Uuid;

    fn next_conversation_id(&mut self) -> ConversationId {
        ConversationId::new(self.next_uuid())
    }

    fn next_message_id(&mut self) -> MessageId {
        MessageId::new(self.next_uuid())
    }
}

/// Deterministic counter-backed ids; the first id is `00000000-0000-0000-0000-000000000001`.
#[derive(Debug, Clone, Default)]
pub struct SequentialIds {
    next: u128,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialIds {
    fn next_uuid(&mut self) -> Uuid {
        self.next = self.next.saturating_add(1);
        Uuid::from_u128(self.next)
    }
}

/// Time-ordered random ids (UUIDv7).
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn next_uuid(&mut self) -> Uuid {
        Uuid::now_v7()
    }
}
