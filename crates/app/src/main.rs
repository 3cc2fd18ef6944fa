use std::process::ExitCode;

use maitri::repl::Repl;
use maitri::settings::SettingsStore;
use maitri_chat::{ChatController, ConversationStore};

/// Application entry point.
///
/// Logs go to stderr so they do not interleave with the transcript on stdout.
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();
    tracing::info!(
        config_path = %settings_store.config_path().display(),
        busy_scope = ?settings.chat.busy_scope,
        "loaded settings"
    );

    let gateway = settings.build_gateway();
    let store = ConversationStore::with_options(settings.chat.clone());
    let controller = ChatController::new(store, gateway);

    match Repl::new(controller, settings_store).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "chat session ended with an error");
            ExitCode::FAILURE
        }
    }
}
