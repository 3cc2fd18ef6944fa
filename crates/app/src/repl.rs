use maitri_chat::{ChatController, ChatEvent, ConversationId, Role};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use crate::settings::SettingsStore;

const HELP_TEXT: &str = "\
commands:
  <text>            send a message to the active conversation
  /new              start a new conversation
  /list             list conversations
  /switch <n|id>    select a conversation by list number or id
  /edit [text]      edit your latest message (no text shows the draft)
  /cancel           abandon the current edit
  /regen            regenerate the latest reply
  /model <id>       switch the assistant model
  /help             show this help
  /quit             exit";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ReplError {
    #[snafu(display("failed to read terminal input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type ReplResult<T> = Result<T, ReplError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    New,
    List,
    Switch(String),
    Edit(Option<String>),
    Cancel,
    Regenerate,
    Model(String),
    Help,
    Quit,
    Unknown(String),
}

/// Parses one input line; blank lines yield `None`.
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Send(line.to_string()));
    };

    let (name, argument) = match rest.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (rest, ""),
    };
    let argument = (!argument.is_empty()).then(|| argument.to_string());

    let command = match (name, argument) {
        ("new", _) => Command::New,
        ("list", _) => Command::List,
        ("switch", Some(target)) => Command::Switch(target),
        ("edit", draft) => Command::Edit(draft),
        ("cancel", _) => Command::Cancel,
        ("regen", _) => Command::Regenerate,
        ("model", Some(model)) => Command::Model(model),
        ("help", _) => Command::Help,
        ("quit" | "exit", _) => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    };
    Some(command)
}

pub struct Repl {
    controller: ChatController,
    settings: SettingsStore,
}

impl Repl {
    pub fn new(controller: ChatController, settings: SettingsStore) -> Self {
        Self {
            controller,
            settings,
        }
    }

    pub async fn run(mut self) -> ReplResult<()> {
        let printer = spawn_reply_printer(&self.controller);

        println!("{HELP_TEXT}\n");
        self.print_transcript();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
            stage: "read-terminal-line",
        })? {
            let Some(command) = parse_command(&line) else {
                continue;
            };
            if command == Command::Quit {
                break;
            }
            self.handle(command);
        }

        printer.abort();
        Ok(())
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Send(text) => {
                if self.controller.submit(&text).is_none() {
                    println!("(busy, message not sent)");
                }
            }
            Command::New => {
                self.controller.create_conversation();
                self.print_transcript();
            }
            Command::List => self.print_conversations(),
            Command::Switch(target) => self.switch(&target),
            Command::Edit(draft) => self.edit(draft),
            Command::Cancel => {
                if !self.controller.cancel_edit() {
                    println!("(no edit in progress)");
                }
            }
            Command::Regenerate => {
                if self.controller.regenerate().is_none() {
                    println!("(nothing to regenerate right now)");
                }
            }
            Command::Model(model) => self.switch_model(model),
            Command::Help => println!("{HELP_TEXT}"),
            Command::Quit => {}
            Command::Unknown(line) => println!("unknown command `{line}`, try /help"),
        }
    }

    fn switch(&self, target: &str) {
        let by_index = target.parse::<usize>().ok().and_then(|position| {
            self.controller.read(|store| {
                position
                    .checked_sub(1)
                    .and_then(|index| store.conversations().get(index))
                    .map(|conversation| conversation.id())
            })
        });

        let conversation_id = match by_index {
            Some(conversation_id) => conversation_id,
            None => match ConversationId::parse(target) {
                Ok(conversation_id) => conversation_id,
                Err(error) => {
                    println!("{error}");
                    return;
                }
            },
        };

        match self.controller.select_conversation(conversation_id) {
            Ok(()) => self.print_transcript(),
            Err(error) => println!("{error}"),
        }
    }

    fn edit(&self, draft: Option<String>) {
        if self.controller.editing_message_id().is_none() {
            let Some(message_id) = self.controller.editable_message_id() else {
                println!("(nothing to edit right now)");
                return;
            };
            self.controller.begin_edit(message_id);
        }

        match draft {
            Some(text) => {
                self.controller.update_edit_draft(text);
                if self.controller.save_edit().is_none() {
                    println!("(edit not saved)");
                }
            }
            None => {
                let current = self
                    .controller
                    .read(|store| store.editing().map(|draft| draft.text.clone()));
                if let Some(text) = current {
                    println!("editing: {text}\n(use /edit <text> to save or /cancel)");
                }
            }
        }
    }

    /// Saves the new model and swaps the gateway; a failed save keeps the current one.
    fn switch_model(&mut self, model: String) {
        match self.settings.update(|settings| settings.model = model) {
            Ok(effective) => {
                self.controller.replace_gateway(effective.build_gateway());
                println!("(model set to {})", effective.model);
            }
            Err(error) => {
                tracing::warn!(error = %error, "model change was not saved");
                println!(
                    "(could not save settings: {error}; still using {})",
                    self.settings.settings().model
                );
            }
        }
    }

    fn print_conversations(&self) {
        self.controller.read(|store| {
            let active = store.active_conversation_id();
            for (index, conversation) in store.conversations().iter().enumerate() {
                let marker = if conversation.id() == active { '*' } else { ' ' };
                let busy = if store.is_conversation_busy(conversation.id()) {
                    " (waiting)"
                } else {
                    ""
                };
                println!(
                    "{marker} {}. {}{busy}  [{}]",
                    index + 1,
                    conversation.title(),
                    conversation.id()
                );
            }
        });
    }

    fn print_transcript(&self) {
        self.controller.read(|store| {
            let Some(conversation) = store.active_conversation() else {
                return;
            };
            println!("== {} ==", conversation.title());
            for message in conversation.messages() {
                let speaker = match message.role {
                    Role::User => "you",
                    Role::Assistant => "maitri",
                };
                println!("{speaker}> {}", message.text);
            }
        });
    }
}

fn spawn_reply_printer(controller: &ChatController) -> JoinHandle<()> {
    let mut events = controller.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let ChatEvent::ReplyAppended {
                conversation_id,
                text,
                fallback,
                ..
            } = event
            {
                if fallback {
                    tracing::debug!(%conversation_id, "showing fallback reply");
                }
                println!("maitri [{}]> {text}", short_id(conversation_id));
            }
        }
    })
}

fn short_id(conversation_id: ConversationId) -> String {
    conversation_id.to_string().chars().take(8).collect()
}
