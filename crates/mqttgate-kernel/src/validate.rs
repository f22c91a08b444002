use std::collections::{BTreeMap, BTreeSet};

use mqttgate_contracts::Params;
use regex::Regex;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("parameter {key:?} is not allowed")]
    UnknownKey { key: String },
    #[error("parameter {key:?} does not match its pattern")]
    PatternMismatch { key: String },
}

impl ValidationError {
    pub fn key(&self) -> &str {
        match self {
            ValidationError::UnknownKey { key } | ValidationError::PatternMismatch { key } => key,
        }
    }
}

/// Allow-list and per-key value patterns for one route.
///
/// Patterns are compiled once here. A pattern that does not compile is kept
/// out of the map and therefore never rejects anything.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    allowed: Option<BTreeSet<String>>,
    patterns: BTreeMap<String, Regex>,
}

impl Policy {
    pub fn new<A, P>(allowed: Option<A>, patterns: P) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        P: IntoIterator<Item = (String, String)>,
    {
        let mut compiled = BTreeMap::new();
        for (key, source) in patterns {
            match Regex::new(&source) {
                Ok(re) => {
                    compiled.insert(key, re);
                }
                Err(err) => {
                    warn!(
                        key = %key,
                        pattern = %source,
                        error = %err,
                        "value pattern does not compile; values for this key are not checked"
                    );
                }
            }
        }
        Self {
            allowed: allowed.map(|keys| keys.into_iter().map(Into::into).collect()),
            patterns: compiled,
        }
    }

    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn is_unconstrained(&self) -> bool {
        self.allowed.is_none() && self.patterns.is_empty()
    }

    pub fn validate(&self, params: &Params) -> Result<(), ValidationError> {
        if self.is_unconstrained() {
            return Ok(());
        }
        for param in params {
            if let Some(allowed) = &self.allowed {
                if !allowed.contains(&param.key) {
                    return Err(ValidationError::UnknownKey {
                        key: param.key.clone(),
                    });
                }
            }
            if let Some(re) = self.patterns.get(&param.key) {
                if !re.is_match(&param.value) {
                    return Err(ValidationError::PatternMismatch {
                        key: param.key.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
