use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use maitri_llm::AssistantGateway;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::ChatResult;
use super::ids::{ConversationId, MessageId, RequestId};
use super::message::Conversation;
use super::store::{Admission, ConversationStore, PendingReply, SettledReply};

/// Change notification published after every accepted intent and every settled reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    ConversationCreated {
        conversation_id: ConversationId,
    },
    ConversationSelected {
        conversation_id: ConversationId,
    },
    UserMessageAppended {
        conversation_id: ConversationId,
        message_id: MessageId,
        text: String,
    },
    TranscriptTruncated {
        conversation_id: ConversationId,
        len: usize,
    },
    ReplyRequested {
        conversation_id: ConversationId,
        request_id: RequestId,
    },
    ReplyAppended {
        conversation_id: ConversationId,
        message_id: MessageId,
        text: String,
        fallback: bool,
    },
    EditStarted {
        message_id: MessageId,
    },
    EditClosed {
        message_id: MessageId,
        saved: bool,
    },
}

#[derive(Clone, Default)]
struct EventHub {
    senders: Arc<Mutex<Vec<mpsc::UnboundedSender<ChatEvent>>>>,
}

impl EventHub {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChatEvent> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event_tx);
        event_rx
    }

    fn emit(&self, event: ChatEvent) {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        // Receivers that went away are pruned on the next emit.
        senders.retain(|sender| sender.send(event.clone()).is_ok());
    }
}

/// Outstanding assistant call spawned by the controller.
pub struct ReplyHandle {
    conversation_id: ConversationId,
    request_id: RequestId,
    task: JoinHandle<Option<SettledReply>>,
}

impl ReplyHandle {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Waits until the reply (or its fallback) has been appended.
    pub async fn settled(self) -> Option<SettledReply> {
        match self.task.await {
            Ok(settled) => settled,
            Err(error) => {
                tracing::error!(
                    conversation_id = %self.conversation_id,
                    request_id = self.request_id.0,
                    error = %error,
                    "assistant reply task did not complete"
                );
                None
            }
        }
    }
}

/// Translates user intents into store operations and runs the assistant calls they admit.
///
/// Disallowed intents (blank text, busy gate, no editable message) are ignored the way
/// a disabled control would ignore a click. Must be driven from inside a tokio runtime.
pub struct ChatController {
    store: Arc<Mutex<ConversationStore>>,
    gateway: Arc<dyn AssistantGateway>,
    events: EventHub,
}

impl ChatController {
    pub fn new(store: ConversationStore, gateway: Arc<dyn AssistantGateway>) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            gateway,
            events: EventHub::default(),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Swaps the assistant backend; calls already in flight keep the old one.
    pub fn replace_gateway(&mut self, gateway: Arc<dyn AssistantGateway>) {
        tracing::info!(gateway_id = %gateway.id(), "replacing assistant gateway");
        self.gateway = gateway;
    }

    pub fn gateway_id(&self) -> String {
        self.gateway.id().to_string()
    }

    /// Read-only view of the store.
    pub fn read<R>(&self, reader: impl FnOnce(&ConversationStore) -> R) -> R {
        reader(&*self.lock())
    }

    pub fn is_busy(&self) -> bool {
        self.read(ConversationStore::is_busy)
    }

    pub fn active_conversation_id(&self) -> ConversationId {
        self.read(ConversationStore::active_conversation_id)
    }

    pub fn editing_message_id(&self) -> Option<MessageId> {
        self.read(ConversationStore::editing_message_id)
    }

    pub fn create_conversation(&self) -> ConversationId {
        let conversation_id = self.lock().create_conversation();
        self.events
            .emit(ChatEvent::ConversationCreated { conversation_id });
        conversation_id
    }

    pub fn select_conversation(&self, conversation_id: ConversationId) -> ChatResult<()> {
        self.lock().select_conversation(conversation_id)?;
        self.events
            .emit(ChatEvent::ConversationSelected { conversation_id });
        Ok(())
    }

    /// Mirrors the send control: enabled for non-blank text when idle and not editing.
    pub fn can_submit(&self, text: &str) -> bool {
        !text.trim().is_empty()
            && self.read(|store| !store.is_busy() && store.editing().is_none())
    }

    pub fn submit(&self, text: &str) -> Option<ReplyHandle> {
        let (pending, appended) = {
            let mut store = self.lock();
            let pending = Self::admitted("submit", store.send_message(text))?;
            (pending, Self::appended_event(&store, text))
        };

        if let Some(appended) = appended {
            self.events.emit(appended);
        }
        Some(self.spawn_reply(pending))
    }

    /// The one message the edit affordance is offered on: the latest user message of the
    /// active conversation, while nothing is pending there and no edit is open.
    pub fn editable_message_id(&self) -> Option<MessageId> {
        self.read(|store| {
            if store.is_busy() || store.editing().is_some() {
                return None;
            }
            store
                .active_conversation()
                .and_then(Conversation::last_user_message)
                .map(|message| message.id)
        })
    }

    pub fn begin_edit(&self, message_id: MessageId) -> bool {
        if self.editable_message_id() != Some(message_id) {
            tracing::debug!(message_id = %message_id, "edit is not offered on this message");
            return false;
        }

        if let Err(rejection) = self.lock().begin_edit(message_id) {
            tracing::debug!(reason = %rejection, "ignored chat intent `begin_edit`");
            return false;
        }

        self.events.emit(ChatEvent::EditStarted { message_id });
        true
    }

    pub fn update_edit_draft(&self, text: impl Into<String>) -> bool {
        match self.lock().update_edit_draft(text) {
            Ok(()) => true,
            Err(rejection) => {
                tracing::debug!(reason = %rejection, "ignored chat intent `update_edit_draft`");
                false
            }
        }
    }

    pub fn save_edit(&self) -> Option<ReplyHandle> {
        let (pending, edited_message_id, events) = {
            let mut store = self.lock();
            let edited_message_id = store.editing_message_id()?;
            let pending = Self::admitted("save_edit", store.save_edit())?;
            let truncated_len = store
                .conversation(pending.conversation_id)
                .map_or(0, |conversation| conversation.len().saturating_sub(1));
            let mut events = vec![ChatEvent::TranscriptTruncated {
                conversation_id: pending.conversation_id,
                len: truncated_len,
            }];
            events.extend(Self::appended_event(&store, &pending.query));
            (pending, edited_message_id, events)
        };

        self.events.emit(ChatEvent::EditClosed {
            message_id: edited_message_id,
            saved: true,
        });
        for event in events {
            self.events.emit(event);
        }
        Some(self.spawn_reply(pending))
    }

    pub fn cancel_edit(&self) -> bool {
        let Some(draft) = self.lock().cancel_edit() else {
            return false;
        };

        self.events.emit(ChatEvent::EditClosed {
            message_id: draft.message_id,
            saved: false,
        });
        true
    }

    /// Mirrors the regenerate control: shown once a reply exists, disabled while busy.
    pub fn can_regenerate(&self) -> bool {
        self.read(|store| {
            !store.is_busy()
                && store
                    .active_conversation()
                    .is_some_and(Conversation::has_assistant_message)
        })
    }

    pub fn regenerate(&self) -> Option<ReplyHandle> {
        let (pending, truncated) = {
            let mut store = self.lock();
            let pending = Self::admitted("regenerate", store.regenerate())?;
            let len = store
                .conversation(pending.conversation_id)
                .map_or(0, Conversation::len);
            let truncated = ChatEvent::TranscriptTruncated {
                conversation_id: pending.conversation_id,
                len,
            };
            (pending, truncated)
        };

        self.events.emit(truncated);
        Some(self.spawn_reply(pending))
    }

    fn spawn_reply(&self, pending: PendingReply) -> ReplyHandle {
        let conversation_id = pending.conversation_id;
        let request_id = pending.request_id;
        let store = Arc::clone(&self.store);
        let gateway = Arc::clone(&self.gateway);
        let events = self.events.clone();

        events.emit(ChatEvent::ReplyRequested {
            conversation_id,
            request_id,
        });

        let task = tokio::spawn(async move {
            let asked = AssertUnwindSafe(async { gateway.ask(&pending.query).await })
                .catch_unwind()
                .await;
            // A panicking gateway still has to release the busy slot.
            let outcome = match asked {
                Ok(outcome) => outcome.map_err(|error| error.to_string()),
                Err(_) => Err("assistant gateway panicked".to_string()),
            };
            let settled = lock_store(&store).settle(&pending, outcome);

            match settled {
                Ok(reply) => {
                    events.emit(ChatEvent::ReplyAppended {
                        conversation_id: reply.conversation_id,
                        message_id: reply.message_id,
                        text: reply.text.clone(),
                        fallback: reply.fallback,
                    });
                    Some(reply)
                }
                Err(rejection) => {
                    tracing::warn!(reason = %rejection, "assistant reply was not applied");
                    None
                }
            }
        });

        ReplyHandle {
            conversation_id,
            request_id,
            task,
        }
    }

    fn admitted(operation: &'static str, admission: Admission) -> Option<PendingReply> {
        match admission {
            Ok(pending) => Some(pending),
            Err(rejection) => {
                tracing::debug!(operation, reason = %rejection, "ignored chat intent");
                None
            }
        }
    }

    fn appended_event(store: &ConversationStore, text: &str) -> Option<ChatEvent> {
        let conversation_id = store.active_conversation_id();
        store
            .active_conversation()
            .and_then(Conversation::last)
            .map(|message| ChatEvent::UserMessageAppended {
                conversation_id,
                message_id: message.id,
                text: text.to_string(),
            })
    }

    fn lock(&self) -> MutexGuard<'_, ConversationStore> {
        lock_store(&self.store)
    }
}

fn lock_store(store: &Mutex<ConversationStore>) -> MutexGuard<'_, ConversationStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use futures::future::BoxFuture;
    use maitri_llm::{ProviderError, ProviderResult, UnavailableGateway};
    use tokio::sync::Semaphore;

    use super::*;
    use crate::ids::SequentialIds;
    use crate::message::{FALLBACK_REPLY_TEXT, GREETING_TEXT, Role};
    use crate::store::{BusyScope, ChatOptions};

    /// Replies from a script, one entry per call, each only after `release` is called.
    struct GatedGateway {
        replies: StdMutex<VecDeque<ProviderResult<String>>>,
        queries: StdMutex<Vec<String>>,
        gate: Semaphore,
    }

    impl GatedGateway {
        fn new(replies: impl IntoIterator<Item = &'static str>) -> Arc<Self> {
            Arc::new(Self {
                replies: StdMutex::new(
                    replies
                        .into_iter()
                        .map(|reply| Ok(reply.to_string()))
                        .collect(),
                ),
                queries: StdMutex::new(Vec::new()),
                gate: Semaphore::new(0),
            })
        }

        fn open() -> Arc<Self> {
            let gateway = Self::new([]);
            gateway.gate.add_permits(Semaphore::MAX_PERMITS / 2);
            gateway
        }

        fn push_reply(&self, reply: &str) {
            self.replies
                .lock()
                .expect("replies lock")
                .push_back(Ok(reply.to_string()));
        }

        fn push_failure(&self) {
            self.replies
                .lock()
                .expect("replies lock")
                .push_back(Err(ProviderError::NotConfigured {
                    stage: "test",
                    reason: "scripted failure".to_string(),
                }));
        }

        fn release(&self, count: usize) {
            self.gate.add_permits(count);
        }

        fn queries(&self) -> Vec<String> {
            self.queries.lock().expect("queries lock").clone()
        }
    }

    impl AssistantGateway for GatedGateway {
        fn id(&self) -> &str {
            "gated"
        }

        fn ask<'a>(&'a self, query: &'a str) -> BoxFuture<'a, ProviderResult<String>> {
            Box::pin(async move {
                self.queries
                    .lock()
                    .expect("queries lock")
                    .push(query.to_string());
                self.gate
                    .acquire()
                    .await
                    .expect("gate is never closed")
                    .forget();
                self.replies
                    .lock()
                    .expect("replies lock")
                    .pop_front()
                    .unwrap_or_else(|| Ok(format!("echo: {query}")))
            })
        }
    }

    fn controller_with(gateway: Arc<dyn AssistantGateway>, busy_scope: BusyScope) -> ChatController {
        let store = ConversationStore::new(ChatOptions { busy_scope }, SequentialIds::new());
        ChatController::new(store, gateway)
    }

    fn transcript(controller: &ChatController) -> Vec<(Role, String)> {
        controller.read(|store| {
            store
                .active_conversation()
                .map(|conversation| {
                    conversation
                        .messages()
                        .iter()
                        .map(|message| (message.role, message.text.clone()))
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    #[tokio::test]
    async fn submit_and_regenerate_scenario() {
        let gateway = GatedGateway::open();
        gateway.push_reply("Try a warm compress.");
        gateway.push_reply("Rest and hydrate.");
        let controller = controller_with(gateway.clone(), BusyScope::Global);
        controller.create_conversation();

        let handle = controller.submit("I have cramps").expect("submit accepted");
        let settled = handle.settled().await.expect("reply settled");
        assert!(!settled.fallback);
        assert_eq!(
            controller.read(|store| store.active_conversation().map(|c| c.title().to_string())),
            Some("I have cramps".to_string())
        );

        let handle = controller.regenerate().expect("regenerate accepted");
        handle.settled().await.expect("reply settled");

        assert_eq!(
            transcript(&controller),
            vec![
                (Role::Assistant, GREETING_TEXT.to_string()),
                (Role::User, "I have cramps".to_string()),
                (Role::Assistant, "Rest and hydrate.".to_string()),
            ]
        );
        assert_eq!(gateway.queries(), vec!["I have cramps", "I have cramps"]);
    }

    #[tokio::test]
    async fn busy_gate_ignores_intents_until_reply_settles() {
        let gateway = GatedGateway::new(["first reply"]);
        let controller = controller_with(gateway.clone(), BusyScope::Global);

        let handle = controller.submit("first").expect("submit accepted");
        assert!(controller.is_busy());
        let before = transcript(&controller);

        assert!(!controller.can_submit("second"));
        assert!(controller.submit("second").is_none());
        assert!(!controller.can_regenerate());
        assert!(controller.regenerate().is_none());
        assert!(controller.editable_message_id().is_none());
        assert!(controller.save_edit().is_none());
        assert_eq!(transcript(&controller), before);

        gateway.release(1);
        handle.settled().await.expect("reply settled");

        assert!(!controller.is_busy());
        assert!(controller.can_submit("second"));
        assert_eq!(transcript(&controller).len(), 3);
    }

    #[tokio::test]
    async fn edit_and_resend_replaces_tail() {
        let gateway = GatedGateway::open();
        gateway.push_reply("a1");
        gateway.push_reply("a2");
        gateway.push_reply("a2 revised");
        let controller = controller_with(gateway.clone(), BusyScope::PerConversation);

        controller.submit("u1").expect("submit").settled().await;
        controller.submit("u2").expect("submit").settled().await;

        let u2_id = controller.editable_message_id().expect("latest user message is editable");
        let u1_id = controller.read(|store| {
            store.active_conversation().expect("active").messages()[1].id
        });
        assert!(!controller.begin_edit(u1_id), "only the latest user message is offered");
        assert!(controller.begin_edit(u2_id));
        assert_eq!(controller.editing_message_id(), Some(u2_id));
        assert!(!controller.can_submit("blocked while editing"));
        assert!(controller.update_edit_draft("new text"));

        let handle = controller.save_edit().expect("save accepted");
        assert!(controller.editing_message_id().is_none());
        handle.settled().await.expect("reply settled");

        assert_eq!(
            transcript(&controller),
            vec![
                (Role::Assistant, GREETING_TEXT.to_string()),
                (Role::User, "u1".to_string()),
                (Role::Assistant, "a1".to_string()),
                (Role::User, "new text".to_string()),
                (Role::Assistant, "a2 revised".to_string()),
            ]
        );
        assert_eq!(gateway.queries(), vec!["u1", "u2", "new text"]);
    }

    #[tokio::test]
    async fn cancel_edit_leaves_transcript_alone() {
        let gateway = GatedGateway::open();
        let controller = controller_with(gateway, BusyScope::PerConversation);
        controller.submit("u1").expect("submit").settled().await;
        let before = transcript(&controller);

        let message_id = controller.editable_message_id().expect("editable");
        assert!(controller.begin_edit(message_id));
        assert!(controller.update_edit_draft("discarded"));
        assert!(controller.cancel_edit());
        assert!(!controller.cancel_edit());

        assert_eq!(transcript(&controller), before);
        assert!(controller.save_edit().is_none());
    }

    #[tokio::test]
    async fn failed_call_appends_fallback_and_clears_busy() {
        let gateway: Arc<dyn AssistantGateway> = Arc::new(UnavailableGateway::new("offline"));
        let controller = controller_with(gateway, BusyScope::Global);
        let mut events = controller.subscribe();

        let settled = controller
            .submit("hello")
            .expect("submit accepted")
            .settled()
            .await
            .expect("fallback settled");

        assert!(settled.fallback);
        assert_eq!(settled.text, FALLBACK_REPLY_TEXT);
        assert!(!controller.is_busy());
        assert!(controller.can_regenerate());

        let mut saw_fallback = false;
        while let Ok(event) = events.try_recv() {
            if let ChatEvent::ReplyAppended { fallback, text, .. } = event {
                saw_fallback = fallback && text == FALLBACK_REPLY_TEXT;
            }
        }
        assert!(saw_fallback);
    }

    #[tokio::test]
    async fn scripted_failure_then_regenerate_recovers() {
        let gateway = GatedGateway::open();
        gateway.push_failure();
        gateway.push_reply("recovered");
        let controller = controller_with(gateway, BusyScope::Global);

        controller.submit("help").expect("submit").settled().await;
        assert_eq!(
            transcript(&controller).last().map(|(_, text)| text.clone()),
            Some(FALLBACK_REPLY_TEXT.to_string())
        );

        controller.regenerate().expect("regenerate").settled().await;
        assert_eq!(
            transcript(&controller).last().map(|(_, text)| text.clone()),
            Some("recovered".to_string())
        );
        assert_eq!(transcript(&controller).len(), 3);
    }

    #[tokio::test]
    async fn reply_follows_its_conversation_after_switch() {
        let gateway = GatedGateway::new(["intro reply"]);
        let controller = controller_with(gateway.clone(), BusyScope::PerConversation);
        let intro = controller.active_conversation_id();

        let handle = controller.submit("question").expect("submit accepted");
        let other = controller.create_conversation();
        assert!(!controller.is_busy());

        gateway.release(1);
        let settled = handle.settled().await.expect("reply settled");

        assert_eq!(settled.conversation_id, intro);
        assert_eq!(controller.active_conversation_id(), other);
        assert_eq!(transcript(&controller).len(), 1);

        controller.select_conversation(intro).expect("intro exists");
        assert_eq!(
            transcript(&controller),
            vec![
                (Role::Assistant, GREETING_TEXT.to_string()),
                (Role::User, "question".to_string()),
                (Role::Assistant, "intro reply".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn global_scope_serializes_across_conversations() {
        let gateway = GatedGateway::new(["one"]);
        let controller = controller_with(gateway.clone(), BusyScope::Global);

        let handle = controller.submit("first").expect("submit accepted");
        controller.create_conversation();
        assert!(controller.is_busy());
        assert!(controller.submit("second").is_none());

        gateway.release(1);
        handle.settled().await;
        assert!(controller.submit("second").is_some());
    }

    #[tokio::test]
    async fn events_describe_accepted_intents() {
        let gateway = GatedGateway::open();
        let controller = controller_with(gateway, BusyScope::Global);
        let mut events = controller.subscribe();

        let created = controller.create_conversation();
        assert!(controller.submit("   ").is_none());
        controller.submit("hi").expect("submit").settled().await;

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }

        assert_eq!(
            received.first(),
            Some(&ChatEvent::ConversationCreated {
                conversation_id: created
            })
        );
        assert!(matches!(
            received.get(1),
            Some(ChatEvent::UserMessageAppended { text, .. }) if text == "hi"
        ));
        assert!(matches!(received.get(2), Some(ChatEvent::ReplyRequested { .. })));
        assert!(matches!(
            received.get(3),
            Some(ChatEvent::ReplyAppended { text, fallback: false, .. }) if text == "echo: hi"
        ));
        assert_eq!(received.len(), 4);
    }

    #[tokio::test]
    async fn selecting_unknown_conversation_is_an_error() {
        let controller = controller_with(GatedGateway::open(), BusyScope::Global);
        let unknown = ConversationId::new(uuid::Uuid::from_u128(77));

        assert!(controller.select_conversation(unknown).is_err());
    }

    struct PanickingGateway;

    impl AssistantGateway for PanickingGateway {
        fn id(&self) -> &str {
            "panicking"
        }

        fn ask<'a>(&'a self, _query: &'a str) -> BoxFuture<'a, ProviderResult<String>> {
            panic!("gateway exploded")
        }
    }

    #[tokio::test]
    async fn panicking_gateway_settles_with_fallback_and_frees_the_gate() {
        let controller = controller_with(Arc::new(PanickingGateway), BusyScope::Global);

        let handle = controller.submit("hello").expect("submit accepted");
        let settled = handle.settled().await.expect("reply settled");

        assert!(settled.fallback);
        assert_eq!(settled.text, FALLBACK_REPLY_TEXT);
        assert!(!controller.is_busy());
        assert!(controller.can_submit("again"));
    }
}
