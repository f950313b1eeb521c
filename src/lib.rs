// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! logwarden: instrument-log routing and baseline renaming agent
//!
//! Watches folders for new instrument logs, waits for each file to settle,
//! copies it to the folder chosen by the first matching filename pattern,
//! and uses timestamps parsed from baseline files to rename matching files
//! in compare folders.

pub mod agent;
pub mod baseline;
pub mod config;
pub mod error;
pub mod history;
pub mod lock;
pub mod router;
pub mod stability;
pub mod watcher;

pub use agent::{Agent, AgentEvent, Outcome};
pub use config::AppConfig;
pub use error::{Result, WardenError};
