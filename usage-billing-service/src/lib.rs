//! Usage billing: a billable-event ledger with exactly-once charging, a spend
//! guardrail in front of paid provider calls, and per-session generation
//! quotas, all scoped per shop.

pub mod clock;
pub mod config;
pub mod dtos;
pub mod handlers;
pub mod models;
pub mod money;
pub mod services;
pub mod startup;
