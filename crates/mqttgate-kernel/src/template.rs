//! `$key` placeholder substitution over request parameters.
//!
//! Substitution is literal: `$action` is replaced by the value of `action`,
//! with no escaping and no delimiter after the key name. `substitute_all`
//! applies keys one after another in parameter order, so a value that itself
//! contains `$other` is expanded only when `other` comes later in that order.

use mqttgate_contracts::Params;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("invalid argument: search token must not be empty")]
    EmptyNeedle,
}

/// Replaces every non-overlapping occurrence of `needle`, scanning left to
/// right and resuming after each replaced region.
pub fn replace(haystack: &str, needle: &str, replacement: &str) -> Result<String, TemplateError> {
    if needle.is_empty() {
        return Err(TemplateError::EmptyNeedle);
    }

    let mut out = String::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(pos) = rest.find(needle) {
        out.push_str(&rest[..pos]);
        out.push_str(replacement);
        rest = &rest[pos + needle.len()..];
    }
    out.push_str(rest);
    Ok(out)
}

pub fn substitute_one(params: &Params, key: &str, template: &str) -> Result<String, TemplateError> {
    let Some(value) = params.lookup(key) else {
        return Ok(template.to_string());
    };
    replace(template, &placeholder(key), value)
}

pub fn substitute_all(params: &Params, template: &str) -> Result<String, TemplateError> {
    let mut out = template.to_string();
    for key in params.keys() {
        out = substitute_one(params, key, &out)?;
    }
    Ok(out)
}

fn placeholder(key: &str) -> String {
    format!("${key}")
}
