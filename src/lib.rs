//! sandgate — gateway fronting a sandboxed long-lived agent process.
//!
//! Two responsibilities carry the weight of this crate:
//!
//! - the [`supervisor`] guarantees at most one agent process per sandbox,
//!   discovers a running instance across concurrent callers, starts one
//!   when absent, and blocks until it is port-ready;
//! - the [`auth`] gate classifies every request into a trust tier
//!   (public / identity / shared-secret) and enforces the right check,
//!   including dev/e2e bypass modes that can never leak across tiers.
//!
//! Everything else is routing and proxy plumbing around those two.

pub mod auth;
pub mod config;
pub mod error;
pub mod sandbox;
pub mod server;
pub mod supervisor;
