use serde::{Deserialize, Serialize};

use super::ids::{ConversationId, MessageId};

pub const GREETING_TEXT: &str =
    "Hello! I'm Maitri, your personal health assistant. How can I help you today?";
pub const FALLBACK_REPLY_TEXT: &str =
    "I'm having a little trouble connecting right now. Please try again later.";
pub const INITIAL_CONVERSATION_TITLE: &str = "Introduction";
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Chat";
pub const TITLE_MAX_CHARS: usize = 25;
pub const TITLE_ELLIPSIS: &str = "...";

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One transcript entry. Never edited in place; edits replace the tail instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub text: String,
}

impl Message {
    pub fn new(id: MessageId, role: Role, text: impl Into<String>) -> Self {
        Self {
            id,
            role,
            text: text.into(),
        }
    }

    pub fn user(id: MessageId, text: impl Into<String>) -> Self {
        Self::new(id, Role::User, text)
    }

    pub fn assistant(id: MessageId, text: impl Into<String>) -> Self {
        Self::new(id, Role::Assistant, text)
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}

/// Conversation aggregate: identity, display title and the ordered transcript.
///
/// The transcript only grows at the tail or is truncated from the tail. The title is
/// derived from the first user message exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    id: ConversationId,
    title: String,
    title_derived: bool,
    messages: Vec<Message>,
}

impl Conversation {
    /// Creates a conversation holding only the assistant greeting.
    pub fn new(id: ConversationId, title: impl Into<String>, greeting: Message) -> Self {
        Self {
            id,
            title: title.into(),
            title_derived: false,
            messages: vec![greeting],
        }
    }

    pub fn id(&self) -> ConversationId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn position_of(&self, message_id: MessageId) -> Option<usize> {
        self.messages
            .iter()
            .position(|message| message.id == message_id)
    }

    pub fn message(&self, message_id: MessageId) -> Option<&Message> {
        self.messages
            .iter()
            .find(|message| message.id == message_id)
    }

    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|message| message.is_user())
    }

    pub fn has_assistant_message(&self) -> bool {
        self.messages.iter().any(Message::is_assistant)
    }

    /// True while the transcript is still the untouched greeting.
    pub fn is_pristine(&self) -> bool {
        matches!(self.messages.as_slice(), [only] if only.is_assistant())
    }

    /// Appends a user message, deriving the title on the first one.
    pub(crate) fn push_user(&mut self, message: Message) {
        if !self.title_derived && self.is_pristine() {
            self.title = derive_title(&message.text);
            self.title_derived = true;
        }
        self.messages.push(message);
    }

    pub(crate) fn push_assistant(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Keeps only the first `len` messages.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.messages.truncate(len);
    }
}

/// Display title for a conversation whose first user message is `text`.
pub fn derive_title(text: &str) -> String {
    let mut characters = text.chars();
    let head = characters.by_ref().take(TITLE_MAX_CHARS).collect::<String>();

    if characters.next().is_some() {
        format!("{head}{TITLE_ELLIPSIS}")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{IdGenerator, SequentialIds};

    fn fresh_conversation(ids: &mut SequentialIds) -> Conversation {
        let greeting = Message::assistant(ids.next_message_id(), GREETING_TEXT);
        Conversation::new(
            ids.next_conversation_id(),
            DEFAULT_CONVERSATION_TITLE,
            greeting,
        )
    }

    #[test]
    fn short_titles_are_kept_verbatim() {
        assert_eq!(derive_title("I have cramps"), "I have cramps");
        assert_eq!(derive_title(&"a".repeat(25)), "a".repeat(25));
    }

    #[test]
    fn long_titles_are_cut_at_twenty_five_characters() {
        let title = derive_title("How can I ease lower back pain during my period?");

        assert_eq!(title, "How can I ease lower back...");
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + TITLE_ELLIPSIS.len());
    }

    #[test]
    fn title_truncation_counts_characters_not_bytes() {
        let text = "é".repeat(30);
        assert_eq!(derive_title(&text), format!("{}...", "é".repeat(25)));
    }

    #[test]
    fn new_conversation_starts_with_single_greeting() {
        let mut ids = SequentialIds::new();
        let conversation = fresh_conversation(&mut ids);

        assert!(conversation.is_pristine());
        assert_eq!(conversation.len(), 1);
        assert_eq!(conversation.messages()[0].text, GREETING_TEXT);
        assert_eq!(conversation.title(), DEFAULT_CONVERSATION_TITLE);
        assert!(conversation.last_user_message().is_none());
    }

    #[test]
    fn title_is_derived_once() {
        let mut ids = SequentialIds::new();
        let mut conversation = fresh_conversation(&mut ids);

        conversation.push_user(Message::user(ids.next_message_id(), "first question"));
        conversation.push_assistant(Message::assistant(ids.next_message_id(), "answer"));
        conversation.push_user(Message::user(ids.next_message_id(), "second question"));
        assert_eq!(conversation.title(), "first question");

        // Back to the bare greeting, as after editing the first user message.
        conversation.truncate(1);
        conversation.push_user(Message::user(ids.next_message_id(), "rewritten"));
        assert_eq!(conversation.title(), "first question");
    }
}
