//! Fax desk: outbound dispatch with retries and inbound triage
//! (classify, match, route) over a libSQL store.

pub mod api;
pub mod app;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod fax;
pub mod notify;
pub mod store;
pub mod triage;
