//! Terminal front end for the Maitri wellness chat.
//!
//! Loads provider settings, wires the assistant gateway into a [`maitri_chat::ChatController`]
//! and drives it from line-oriented input.

pub mod repl;
pub mod settings;
