use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A set of named capabilities (`"code_gen"`, `"voice"`, ...).
///
/// Used both for what an agent offers and for what a task requires. Ordered
/// so that listings and serialized forms are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    capabilities: BTreeSet<String>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&mut self, cap: impl Into<String>) {
        self.capabilities.insert(cap.into());
    }

    pub fn revoke(&mut self, cap: &str) {
        self.capabilities.remove(cap);
    }

    pub fn has(&self, cap: &str) -> bool {
        self.capabilities.contains(cap)
    }

    /// True when every capability in `required` is present here.
    pub fn satisfies(&self, required: &CapabilitySet) -> bool {
        required.capabilities.is_subset(&self.capabilities)
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.capabilities.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.capabilities.iter().cloned().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            capabilities: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl<S: Into<String>, const N: usize> From<[S; N]> for CapabilitySet {
    fn from(caps: [S; N]) -> Self {
        caps.into_iter().collect()
    }
}

impl From<Vec<String>> for CapabilitySet {
    fn from(caps: Vec<String>) -> Self {
        caps.into_iter().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_set() {
        let mut caps = CapabilitySet::new();
        assert!(caps.is_empty());

        caps.grant("code_gen");
        assert!(caps.has("code_gen"));
        assert_eq!(caps.len(), 1);

        caps.revoke("code_gen");
        assert!(!caps.has("code_gen"));
    }

    #[test]
    fn test_satisfies_is_subset() {
        let offered = CapabilitySet::from(["code_gen", "review", "voice"]);
        assert!(offered.satisfies(&CapabilitySet::from(["code_gen"])));
        assert!(offered.satisfies(&CapabilitySet::from(["review", "voice"])));
        assert!(!offered.satisfies(&CapabilitySet::from(["code_gen", "quantum"])));
        // The empty requirement is trivially met.
        assert!(offered.satisfies(&CapabilitySet::new()));
    }

    #[test]
    fn test_serializes_as_sorted_list() {
        let caps = CapabilitySet::from(["voice", "code_gen"]);
        let json = serde_json::to_string(&caps).unwrap();
        assert_eq!(json, r#"["code_gen","voice"]"#);
        let parsed: CapabilitySet = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, caps);
    }
}
