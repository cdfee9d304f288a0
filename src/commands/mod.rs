//! Front-end commands.
//!
//! Each command takes the shared [`AppState`](crate::AppState) and returns
//! `Result<T, String>` so any front end (the bundled REPL, an HTTP layer, a
//! desktop shell) can forward errors to the user as-is.

pub mod chat;
pub mod session;
