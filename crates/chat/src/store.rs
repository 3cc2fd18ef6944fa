use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{ChatResult, NotFoundSnafu};
use super::ids::{ConversationId, IdGenerator, MessageId, RandomIds, RequestId};
use super::message::{
    Conversation, DEFAULT_CONVERSATION_TITLE, FALLBACK_REPLY_TEXT, GREETING_TEXT,
    INITIAL_CONVERSATION_TITLE, Message,
};

/// How far the busy gate reaches while an assistant call is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyScope {
    /// Only the conversation that issued the call is locked.
    #[default]
    PerConversation,
    /// Any outstanding call locks every conversation.
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(default)]
    pub busy_scope: BusyScope,
}

/// In-progress edit of a prior user message in the active conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditDraft {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub text: String,
}

/// Assistant call the store has admitted and is waiting to settle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReply {
    pub conversation_id: ConversationId,
    pub request_id: RequestId,
    pub query: String,
}

/// Assistant message appended when a pending reply settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledReply {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub text: String,
    pub fallback: bool,
}

/// Reason an operation left the store untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    EmptyText,
    Busy {
        conversation_id: ConversationId,
    },
    EditInProgress {
        message_id: MessageId,
    },
    NoEditInProgress,
    MessageNotFound {
        message_id: MessageId,
    },
    NotUserMessage {
        message_id: MessageId,
    },
    NoAssistantMessage,
    NoUserMessage,
    ConversationMissing {
        conversation_id: ConversationId,
    },
    StaleReply {
        conversation_id: ConversationId,
        request_id: RequestId,
    },
}

impl fmt::Display for Rejection {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyText => write!(formatter, "message text is empty"),
            Self::Busy { conversation_id } => {
                write!(formatter, "conversation {conversation_id} is waiting for a reply")
            }
            Self::EditInProgress { message_id } => {
                write!(formatter, "message {message_id} is being edited")
            }
            Self::NoEditInProgress => write!(formatter, "no edit is in progress"),
            Self::MessageNotFound { message_id } => {
                write!(formatter, "message {message_id} is not in the active conversation")
            }
            Self::NotUserMessage { message_id } => {
                write!(formatter, "message {message_id} was not sent by the user")
            }
            Self::NoAssistantMessage => write!(formatter, "no assistant message to regenerate"),
            Self::NoUserMessage => write!(formatter, "no user message precedes the last reply"),
            Self::ConversationMissing { conversation_id } => {
                write!(formatter, "conversation {conversation_id} does not exist")
            }
            Self::StaleReply {
                conversation_id,
                request_id,
            } => write!(
                formatter,
                "reply {} for conversation {conversation_id} is no longer expected",
                request_id.0
            ),
        }
    }
}

pub type Admission = Result<PendingReply, Rejection>;

/// Sole owner and mutator of every conversation and message.
///
/// Operations are synchronous. Those that need the assistant return a [`PendingReply`];
/// the caller runs the gateway call and hands the outcome back to [`Self::settle`].
pub struct ConversationStore {
    // Most recently created first.
    conversations: Vec<Conversation>,
    active_conversation_id: ConversationId,
    in_flight: HashMap<ConversationId, RequestId>,
    editing: Option<EditDraft>,
    options: ChatOptions,
    ids: Box<dyn IdGenerator>,
    next_request_id: u64,
}

impl ConversationStore {
    /// Creates a store seeded with the introduction conversation.
    pub fn new(options: ChatOptions, ids: impl IdGenerator + 'static) -> Self {
        let mut ids: Box<dyn IdGenerator> = Box::new(ids);
        let greeting = Message::assistant(ids.next_message_id(), GREETING_TEXT);
        let introduction = Conversation::new(
            ids.next_conversation_id(),
            INITIAL_CONVERSATION_TITLE,
            greeting,
        );

        Self {
            active_conversation_id: introduction.id(),
            conversations: vec![introduction],
            in_flight: HashMap::new(),
            editing: None,
            options,
            ids,
            next_request_id: 1,
        }
    }

    pub fn with_options(options: ChatOptions) -> Self {
        Self::new(options, RandomIds)
    }

    pub fn options(&self) -> &ChatOptions {
        &self.options
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, conversation_id: ConversationId) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|conversation| conversation.id() == conversation_id)
    }

    pub fn active_conversation_id(&self) -> ConversationId {
        self.active_conversation_id
    }

    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.conversation(self.active_conversation_id)
    }

    /// Busy gate as seen from the active conversation.
    pub fn is_busy(&self) -> bool {
        match self.options.busy_scope {
            BusyScope::Global => !self.in_flight.is_empty(),
            BusyScope::PerConversation => self.in_flight.contains_key(&self.active_conversation_id),
        }
    }

    pub fn is_conversation_busy(&self, conversation_id: ConversationId) -> bool {
        self.in_flight.contains_key(&conversation_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn editing(&self) -> Option<&EditDraft> {
        self.editing.as_ref()
    }

    pub fn editing_message_id(&self) -> Option<MessageId> {
        self.editing.as_ref().map(|draft| draft.message_id)
    }

    pub fn create_conversation(&mut self) -> ConversationId {
        if let Some(abandoned) = self.editing.take() {
            tracing::debug!(
                message_id = %abandoned.message_id,
                "abandoning edit for new conversation"
            );
        }

        let greeting = Message::assistant(self.ids.next_message_id(), GREETING_TEXT);
        let conversation = Conversation::new(
            self.ids.next_conversation_id(),
            DEFAULT_CONVERSATION_TITLE,
            greeting,
        );
        let conversation_id = conversation.id();

        self.conversations.insert(0, conversation);
        self.active_conversation_id = conversation_id;
        tracing::debug!(conversation_id = %conversation_id, "created conversation");
        conversation_id
    }

    pub fn select_conversation(&mut self, conversation_id: ConversationId) -> ChatResult<()> {
        if self.conversation(conversation_id).is_none() {
            return NotFoundSnafu {
                stage: "select-conversation",
                entity: "conversation",
                id: conversation_id.to_string(),
            }
            .fail();
        }

        if self.active_conversation_id != conversation_id
            && let Some(abandoned) = self.editing.take()
        {
            tracing::debug!(
                message_id = %abandoned.message_id,
                "abandoning edit on conversation switch"
            );
        }

        self.active_conversation_id = conversation_id;
        Ok(())
    }

    /// Appends a user message to the active conversation and admits its assistant call.
    pub fn send_message(&mut self, text: &str) -> Admission {
        if text.trim().is_empty() {
            return Err(Rejection::EmptyText);
        }

        if let Some(draft) = &self.editing {
            return Err(Rejection::EditInProgress {
                message_id: draft.message_id,
            });
        }

        self.check_admission()?;
        self.append_user_and_dispatch(text)
    }

    pub fn begin_edit(&mut self, message_id: MessageId) -> Result<(), Rejection> {
        let conversation = self.active_conversation().ok_or(Rejection::ConversationMissing {
            conversation_id: self.active_conversation_id,
        })?;
        let message = conversation
            .message(message_id)
            .ok_or(Rejection::MessageNotFound { message_id })?;

        if !message.is_user() {
            return Err(Rejection::NotUserMessage { message_id });
        }

        let draft = EditDraft {
            conversation_id: conversation.id(),
            message_id,
            text: message.text.clone(),
        };
        self.editing = Some(draft);
        Ok(())
    }

    pub fn update_edit_draft(&mut self, text: impl Into<String>) -> Result<(), Rejection> {
        let draft = self.editing.as_mut().ok_or(Rejection::NoEditInProgress)?;
        draft.text = text.into();
        Ok(())
    }

    pub fn cancel_edit(&mut self) -> Option<EditDraft> {
        self.editing.take()
    }

    /// Drops the edited message and everything after it, then resends the draft.
    ///
    /// A blank draft or a busy conversation leaves both the transcript and the draft as
    /// they were.
    pub fn save_edit(&mut self) -> Admission {
        let draft = self.editing.as_ref().ok_or(Rejection::NoEditInProgress)?;
        if draft.text.trim().is_empty() {
            return Err(Rejection::EmptyText);
        }

        self.check_admission()?;

        let position = self
            .conversation(draft.conversation_id)
            .filter(|conversation| conversation.id() == self.active_conversation_id)
            .and_then(|conversation| conversation.position_of(draft.message_id))
            .ok_or(Rejection::MessageNotFound {
                message_id: draft.message_id,
            })?;

        // The draft is only consumed once the resend is certain.
        let Some(draft) = self.editing.take() else {
            return Err(Rejection::NoEditInProgress);
        };

        if let Some(conversation) = self.active_conversation_mut() {
            conversation.truncate(position);
        }

        self.append_user_and_dispatch(&draft.text)
    }

    /// Replaces the latest assistant reply with a fresh one for the same user message.
    pub fn regenerate(&mut self) -> Admission {
        self.check_admission()?;

        let conversation_id = self.active_conversation_id;
        let conversation = self
            .active_conversation_mut()
            .ok_or(Rejection::ConversationMissing { conversation_id })?;

        let last_reply = conversation
            .messages()
            .iter()
            .rposition(Message::is_assistant)
            .ok_or(Rejection::NoAssistantMessage)?;
        let query = conversation.messages()[..last_reply]
            .iter()
            .rev()
            .find(|message| message.is_user())
            .map(|message| message.text.clone())
            .ok_or(Rejection::NoUserMessage)?;

        conversation.truncate(last_reply);
        Ok(self.dispatch(conversation_id, query))
    }

    /// Appends the outcome of an admitted call to the conversation it was issued for and
    /// releases that conversation's busy slot.
    ///
    /// Failures become the fixed fallback reply; the error itself only reaches the log.
    pub fn settle<E>(
        &mut self,
        pending: &PendingReply,
        outcome: Result<String, E>,
    ) -> Result<SettledReply, Rejection>
    where
        E: fmt::Display,
    {
        let conversation_id = pending.conversation_id;
        if self.in_flight.get(&conversation_id).copied() != Some(pending.request_id) {
            tracing::warn!(
                conversation_id = %conversation_id,
                request_id = pending.request_id.0,
                "dropping reply for a request that is no longer in flight"
            );
            return Err(Rejection::StaleReply {
                conversation_id,
                request_id: pending.request_id,
            });
        }
        self.in_flight.remove(&conversation_id);

        let (text, fallback) = match outcome {
            Ok(text) => (text, false),
            Err(error) => {
                tracing::error!(
                    conversation_id = %conversation_id,
                    request_id = pending.request_id.0,
                    error = %error,
                    "assistant call failed; using fallback reply"
                );
                (FALLBACK_REPLY_TEXT.to_string(), true)
            }
        };

        let message_id = self.ids.next_message_id();
        let conversation = self
            .conversations
            .iter_mut()
            .find(|conversation| conversation.id() == conversation_id)
            .ok_or(Rejection::ConversationMissing { conversation_id })?;
        conversation.push_assistant(Message::assistant(message_id, text.clone()));

        Ok(SettledReply {
            conversation_id,
            message_id,
            text,
            fallback,
        })
    }

    fn check_admission(&self) -> Result<(), Rejection> {
        if self.is_busy() {
            return Err(Rejection::Busy {
                conversation_id: self.active_conversation_id,
            });
        }
        Ok(())
    }

    fn active_conversation_mut(&mut self) -> Option<&mut Conversation> {
        let active_conversation_id = self.active_conversation_id;
        self.conversations
            .iter_mut()
            .find(|conversation| conversation.id() == active_conversation_id)
    }

    fn append_user_and_dispatch(&mut self, text: &str) -> Admission {
        let conversation_id = self.active_conversation_id;
        let message_id = self.ids.next_message_id();
        let conversation = self
            .active_conversation_mut()
            .ok_or(Rejection::ConversationMissing { conversation_id })?;

        conversation.push_user(Message::user(message_id, text));
        Ok(self.dispatch(conversation_id, text.to_string()))
    }

    fn dispatch(&mut self, conversation_id: ConversationId, query: String) -> PendingReply {
        let request_id = RequestId::new(self.next_request_id);
        self.next_request_id = self.next_request_id.saturating_add(1);
        self.in_flight.insert(conversation_id, request_id);

        tracing::debug!(
            conversation_id = %conversation_id,
            request_id = request_id.0,
            "admitted assistant call"
        );

        PendingReply {
            conversation_id,
            request_id,
            query,
        }
    }
}
