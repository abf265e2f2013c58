//! API handlers.

pub mod accounts;
pub mod chat;
pub mod credits;
pub mod health;
pub mod sessions;
pub mod webhooks;
