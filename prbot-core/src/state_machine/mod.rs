//! Explicit state machine for issue and pull-request reconciliation.
//!
//! The design separates:
//! - **State**: what the bot remembers about an issue (`BotCache`)
//! - **Events**: what happened (`Event`)
//! - **Actions**: what to do about it (`Action`)
//! - **Transition**: pure function `(commands, cache, snapshot) -> (cache, Vec<Action>)`
//!
//! The interpreter applies actions against a `ForgeClient` and reports
//! per-action outcomes; the repository module persists the cache.

pub mod action;
pub mod event;
pub mod interpreter;
pub mod repository;
pub mod state;
pub mod test_request;
pub mod transition;

pub use action::*;
pub use event::*;
pub use state::*;
pub use test_request::*;
pub use transition::*;
