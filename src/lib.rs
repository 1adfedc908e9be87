//! Trading control-plane library.
//!
//! Exposes the domain, persistence, broker-client, and business-logic
//! modules for use by the `control-plane` server binary and the
//! `control-plane-migrate` CLI.

pub mod alerts;
pub mod api;
pub mod auth;
pub mod broadcaster;
pub mod broker;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod middleware;
pub mod orchestrator;
pub mod pnl;
pub mod reconciler;
pub mod safe_switch;
