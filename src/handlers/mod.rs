//! Lifecycle handlers (spec §4.4–§4.6, C5–C7): the state-transition logic
//! invoked by the dispatcher for each message kind.

pub mod execution;
pub mod stage;
pub mod task;
