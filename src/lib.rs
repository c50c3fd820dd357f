//! Scheduled security-configuration audits for multi-tenant SIEM/SOAR
//! deployments: fetch, persist, diff, and summarize into reports.

pub mod cli;
pub mod core;
pub mod logging;
pub mod platform;
