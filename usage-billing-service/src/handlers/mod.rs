//! HTTP handlers for usage-billing-service.

pub mod attempts;
pub mod billable_events;
pub mod health;
pub mod spend;
