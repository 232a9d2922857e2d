//! Analysis options

use crate::Error;
use std::fmt;
use std::str::FromStr;

/// Default cap on the number of functions descended into while resolving one handle
pub const DEFAULT_MAX_DEPTH: usize = 3;

/// Which imports an analysis reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImportsType {
    /// Import table and dynamic imports
    #[default]
    All,
    /// Import table only
    ImportTable,
    /// Dynamic imports only
    Dynamic,
}

impl ImportsType {
    /// Returns true if import table entries are reported
    pub fn includes_import_table(self) -> bool {
        self != ImportsType::Dynamic
    }

    /// Returns true if dynamic imports are reported
    pub fn includes_dynamic(self) -> bool {
        self != ImportsType::ImportTable
    }
}

impl FromStr for ImportsType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(ImportsType::All),
            "it" => Ok(ImportsType::ImportTable),
            "dynamic" => Ok(ImportsType::Dynamic),
            other => Err(Error::InvalidParameter(format!(
                "unknown imports type '{}' (expected all, it or dynamic)",
                other
            ))),
        }
    }
}

impl fmt::Display for ImportsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImportsType::All => "all",
            ImportsType::ImportTable => "it",
            ImportsType::Dynamic => "dynamic",
        })
    }
}

/// Tuning of the dynamic import resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverOptions {
    /// Functions descended into while resolving one handle
    pub max_depth: usize,
    /// Run the `__thiscall` fix-up on 32-bit programs
    pub normalize_conventions: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        ResolverOptions {
            max_depth: DEFAULT_MAX_DEPTH,
            normalize_conventions: true,
        }
    }
}
