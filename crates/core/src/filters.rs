//! Relay query filters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::event::{unix_now, Event};

/// Errors that can occur when validating filters.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("the limit must be a positive integer")]
    InvalidLimit,

    #[error("at least one of ids, authors, kinds, or tags must be set")]
    NoSelector,
}

/// A set of filters for querying relays.
///
/// The `limit` should always be included to keep the response size
/// reasonable. `until` defaults to the present at validation time. At least
/// one of `ids`, `authors`, `kinds`, or a tag filter must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filters {
    /// Event ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,

    /// Event author pubkeys, lowercase hex.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,

    /// Event kinds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u16>,

    /// Matching events must not be older than this Unix timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,

    /// Matching events must not be newer than this Unix timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,

    /// The maximum number of stored events the relay should return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,

    /// Tag filters, keyed `"#<x>"` on the wire.
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filters {
    /// Add a tag filter. The leading `#` is added when absent.
    pub fn tag(&mut self, name: &str, values: Vec<String>) -> &mut Self {
        let key = if name.starts_with('#') {
            name.to_string()
        } else {
            format!("#{name}")
        };
        self.tags.insert(key, values);
        self
    }

    /// Validate the filters.
    ///
    /// `until` defaults to the present if it is not already set.
    pub fn validate(&mut self) -> Result<(), FilterError> {
        match self.limit {
            Some(limit) if limit > 0 => {}
            _ => return Err(FilterError::InvalidLimit),
        }
        if self.until.is_none() {
            self.until = Some(unix_now());
        }
        let has_selector = !self.ids.is_empty()
            || !self.authors.is_empty()
            || !self.kinds.is_empty()
            || !self.tags.is_empty();
        if !has_selector {
            return Err(FilterError::NoSelector);
        }
        Ok(())
    }

    /// Whether an event matches these filters.
    ///
    /// Ids and authors match by prefix; `since`/`until` are inclusive; every
    /// tag filter must intersect the event's tags. `limit` does not
    /// participate in matching.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.ids.is_empty() && !self.ids.iter().any(|id| event.id.starts_with(id)) {
            return false;
        }
        if !self.authors.is_empty()
            && !self.authors.iter().any(|a| event.pubkey.starts_with(a))
        {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (key, values) in &self.tags {
            let Some(name) = key.strip_prefix('#') else {
                continue;
            };
            let intersects = event.tags.iter().any(|tag| {
                tag.first().map(String::as_str) == Some(name)
                    && tag.get(1).is_some_and(|value| values.contains(value))
            });
            if !intersects {
                return false;
            }
        }
        true
    }
}
