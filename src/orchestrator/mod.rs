//! Application-level orchestration.
//!
//! This module owns the session lifecycle (control directory, engine, preview
//! scheduling, teardown) and the command input that drives it. Presentation
//! layers call into this module and only see `SessionEvent`s.

mod controller;
mod input;
mod session;

pub(crate) use controller::{run_controller, UiCommand};
pub(crate) use input::{spawn_stdin_reader, HELP};
pub(crate) use session::Session;
