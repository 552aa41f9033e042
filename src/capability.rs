//! Capability URIs and the set exchanged in `<hello>` messages.

const STD_CAP_PREFIX: &str = "urn:ietf:params:netconf:capability";

pub const CAP_BASE_10: &str = "urn:ietf:params:netconf:base:1.0";
pub const CAP_BASE_11: &str = "urn:ietf:params:netconf:base:1.1";

/// Capabilities advertised by the client when none are configured.
pub const DEFAULT_CAPABILITIES: &[&str] = &[CAP_BASE_10, CAP_BASE_11];

/// Expands the shorthand `:candidate`-style form to a full capability URI by
/// prefixing `urn:ietf:params:netconf:capability`. Full URIs pass through
/// unchanged.
pub fn expand_capability(cap: &str) -> String {
    if let Some(rest) = cap.strip_prefix(':') {
        let mut expanded = String::with_capacity(STD_CAP_PREFIX.len() + rest.len() + 1);
        expanded.push_str(STD_CAP_PREFIX);
        expanded.push(':');
        expanded.push_str(rest);
        expanded
    } else {
        cap.to_string()
    }
}

/// An ordered, duplicate-free set of capability URIs.
///
/// Construction normalizes shorthand capabilities with [`expand_capability`];
/// membership checks normalize their argument the same way.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    caps: Vec<String>,
}

impl CapabilitySet {
    pub fn new<I, S>(capabilities: I) -> CapabilitySet
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = CapabilitySet { caps: Vec::new() };
        for cap in capabilities {
            let cap = expand_capability(cap.as_ref());
            if !set.caps.contains(&cap) {
                set.caps.push(cap);
            }
        }
        set
    }

    pub fn has(&self, cap: &str) -> bool {
        let cap = expand_capability(cap);
        self.caps.iter().any(|c| *c == cap)
    }

    pub fn len(&self) -> usize {
        self.caps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.caps.iter().map(String::as_str)
    }
}
