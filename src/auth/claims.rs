//! Verified identity and capability claims

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A set of capability names (e.g. `cases:read`, `manage_users`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    capabilities: BTreeSet<String>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self {
            capabilities: BTreeSet::new(),
        }
    }

    /// Add a capability; duplicates collapse
    pub fn add(&mut self, capability: impl Into<String>) {
        self.capabilities.insert(capability.into());
    }

    /// Parse a comma-separated list, ignoring blanks and surrounding whitespace
    pub fn parse_list(s: &str) -> Self {
        s.split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect()
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// True when every capability in `self` is also in `other`
    pub fn is_subset(&self, other: &CapabilitySet) -> bool {
        self.capabilities.is_subset(&other.capabilities)
    }

    /// Capabilities in `self` that `held` lacks
    pub fn missing_from<'a>(&'a self, held: &'a CapabilitySet) -> Vec<&'a str> {
        self.capabilities
            .difference(&held.capabilities)
            .map(String::as_str)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.capabilities.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut set = CapabilitySet::new();
        for capability in iter {
            set.add(capability);
        }
        set
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        write!(f, "{}", joined.join(","))
    }
}

/// Identity and capabilities of an authenticated principal
///
/// Issued by the auth service at login and carried inside a signed token.
/// Expiry is not part of the claims; it travels next to them in
/// [`DecodedToken`](crate::auth::DecodedToken).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Claims {
    pub subject_id: i64,
    pub username: String,
    pub capabilities: CapabilitySet,
}

impl Claims {
    pub fn new(subject_id: i64, username: impl Into<String>, capabilities: CapabilitySet) -> Self {
        Self {
            subject_id,
            username: username.into(),
            capabilities,
        }
    }

    /// Check whether these claims hold every capability in `required`
    pub fn has_all(&self, required: &CapabilitySet) -> bool {
        required.is_subset(&self.capabilities)
    }
}

impl fmt::Display for Claims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} [{}]", self.username, self.subject_id, self.capabilities)
    }
}
