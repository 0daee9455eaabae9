//! Store locator strings
//!
//! | Form | Meaning |
//! |------|---------|
//! | `/path/to/file` | persisted store |
//! | `mem:<name>` | shared in-memory store |
//! | `mem:<name>:<srs>` | shared in-memory store, `srs` used only on creation |

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

const MEMORY_SCHEME: &str = "mem:";

#[derive(Debug, Error, PartialEq)]
pub enum LocatorError {
    #[error("Empty store locator")]
    Empty,

    #[error("Memory store locator has no name: {0}")]
    MissingName(String),
}

/// Where a vector store lives, resolved once when it is opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Persisted(PathBuf),
    Memory { name: String, srs: Option<String> },
}

impl Locator {
    pub fn memory(name: impl Into<String>, srs: Option<String>) -> Self {
        Locator::Memory {
            name: name.into(),
            srs,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Locator::Memory { .. })
    }
}

impl FromStr for Locator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(LocatorError::Empty);
        }

        let Some(rest) = s.strip_prefix(MEMORY_SCHEME) else {
            return Ok(Locator::Persisted(PathBuf::from(s)));
        };

        // The spatial reference may itself contain ':' so only split once
        let (name, srs) = match rest.split_once(':') {
            Some((name, srs)) => (name, Some(srs)),
            None => (rest, None),
        };
        if name.is_empty() {
            return Err(LocatorError::MissingName(s.to_string()));
        }

        Ok(Locator::Memory {
            name: name.to_string(),
            srs: srs.filter(|v| !v.is_empty()).map(str::to_string),
        })
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Persisted(path) => write!(f, "{}", path.display()),
            Locator::Memory { name, srs: Some(srs) } => write!(f, "{}{}:{}", MEMORY_SCHEME, name, srs),
            Locator::Memory { name, srs: None } => write!(f, "{}{}", MEMORY_SCHEME, name),
        }
    }
}
