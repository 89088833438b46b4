//! cherry-bot — propagates merged changes across branches via cherry-picks.
//!
//! When a change merges with a `Pick-to:` footer, the bot creates a
//! cherry-pick on each named branch, and approves and stages the ones that
//! apply cleanly. Every workflow is persisted and crash-recoverable; a step
//! may suspend for days awaiting an external event and resume in a different
//! process.

pub mod config;
pub mod engine;
pub mod gerrit;
pub mod listeners;
pub mod processor;
pub mod recovery;
pub mod retry;
pub mod server;
pub mod store;
pub mod types;

#[cfg(test)]
pub mod test_utils;
