//! Path-scoped include/exclude policies for retrieval
//!
//! Paths are dotted field names relative to the queried meta. Under a generic
//! field the next segment names the concrete object (`target.person.name`).

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievePolicy {
    /// An include path passes through or ends at this position
    included: bool,
    /// An exclude path ends at this position
    excluded: bool,
    children: BTreeMap<String, RetrievePolicy>,
}

impl RetrievePolicy {
    pub fn new<S: AsRef<str>>(include_paths: &[S], exclude_paths: &[S]) -> Self {
        let mut policy = RetrievePolicy::default();
        for path in include_paths {
            let mut node = &mut policy;
            for segment in split(path.as_ref()) {
                node = node.children.entry(segment.to_string()).or_default();
                node.included = true;
            }
        }
        for path in exclude_paths {
            let mut node = &mut policy;
            let segments: Vec<&str> = split(path.as_ref()).collect();
            for segment in &segments {
                node = node.children.entry(segment.to_string()).or_default();
            }
            if !segments.is_empty() {
                node.excluded = true;
            }
        }
        policy
    }

    pub fn empty() -> Self {
        RetrievePolicy::default()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Policy scoped to the child named `name`
    pub fn sub_policy(&self, name: &str) -> Option<&RetrievePolicy> {
        self.children.get(name)
    }

    /// Scoped policy, or an empty one when nothing is declared below `name`
    pub fn scoped(&self, name: &str) -> RetrievePolicy {
        self.sub_policy(name).cloned().unwrap_or_default()
    }

    /// The child must be expanded even past the depth limit
    pub fn forces(&self, name: &str) -> bool {
        self.children.get(name).map(|p| p.included && !p.excluded).unwrap_or(false)
    }

    pub fn excludes(&self, name: &str) -> bool {
        self.children.get(name).map(|p| p.excluded).unwrap_or(false)
    }

    /// Names referenced directly below this position
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}
