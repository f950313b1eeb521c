// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Filename-pattern routing of stabilized files

use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::RuleConfig;
use crate::lock::can_read_shared;
use crate::Result;

/// A compiled `pattern -> destination` rule
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub pattern: Regex,
    pub destination: PathBuf,
}

impl RoutingRule {
    pub fn new(pattern: &str, destination: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            destination: destination.into(),
        })
    }
}

/// Result of routing one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CopyOutcome {
    /// No rule matched; the file stays where it is
    Unrouted,
    /// Source could not be opened for reading; a later write event retries it
    Deferred { destination: PathBuf },
    /// Copied to `destination`
    Copied { destination: PathBuf, bytes: u64 },
}

impl CopyOutcome {
    pub fn destination(&self) -> Option<&Path> {
        match self {
            CopyOutcome::Unrouted => None,
            CopyOutcome::Deferred { destination } | CopyOutcome::Copied { destination, .. } => {
                Some(destination)
            }
        }
    }
}

/// Ordered routing table; the first matching rule wins
#[derive(Debug, Clone, Default)]
pub struct Router {
    rules: Vec<RoutingRule>,
}

impl Router {
    pub fn new(rules: Vec<RoutingRule>) -> Self {
        Self { rules }
    }

    /// Compile the rules from configuration, preserving their order
    pub fn from_config(rules: &[RuleConfig]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|r| RoutingRule::new(&r.pattern, r.destination.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(rules))
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Destination folder for `path`, matched on the file name only
    pub fn route(&self, path: &Path) -> Option<&Path> {
        let name = path.file_name()?.to_string_lossy();
        let rule = self.rules.iter().find(|rule| rule.pattern.is_match(&name));
        match rule {
            Some(rule) => {
                debug!("{} matched {}", name, rule.pattern);
                Some(rule.destination.as_path())
            }
            None => {
                info!("No routing rule matches {}", name);
                None
            }
        }
    }

    /// Route `source` and copy it into the chosen folder, overwriting any
    /// previous copy
    pub fn copy_to_destination(&self, source: &Path) -> Result<CopyOutcome> {
        let Some(folder) = self.route(source) else {
            return Ok(CopyOutcome::Unrouted);
        };
        let Some(name) = source.file_name() else {
            return Ok(CopyOutcome::Unrouted);
        };
        let destination = folder.join(name);

        if !can_read_shared(source) {
            info!("{:?} is locked, deferring copy", source);
            return Ok(CopyOutcome::Deferred { destination });
        }

        std::fs::create_dir_all(folder)?;
        let bytes = std::fs::copy(source, &destination)?;
        if bytes == 0 {
            warn!("Copied {:?} is empty, source may have been read mid-write", destination);
        }
        info!("Copied {:?} -> {:?} ({} bytes)", source, destination, bytes);

        Ok(CopyOutcome::Copied { destination, bytes })
    }
}
