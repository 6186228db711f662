//! Redis-backed distributed primitives.

pub mod client;
pub mod lua_scripts;

pub use client::{
    RateLimitDecision, RateLimitRule, RateLimiter, ADMIN_COMMAND_RULE, MEMBERSHIP_EVENTS_RULE,
    VERIFY_PAGE_RULE, VERIFY_SUBMIT_RULE,
};
