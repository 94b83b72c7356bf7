//! Descriptor key generation and handling.

use serde::Serialize;

use crate::grpc::proto::rate_limit_descriptor::Entry;
use crate::grpc::proto::RateLimitDescriptor;

/// An ordered set of key/value pairs resolved from a request.
///
/// Descriptors are what the local engine keys its buckets on and what is
/// sent to the shared counting service. Entry order is significant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Descriptor {
    entries: Vec<(String, String)>,
}

impl Descriptor {
    /// Create an empty descriptor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Builder-style variant of [`Descriptor::push`].
    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    /// The entries in insertion order.
    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    /// Look up the value of the first entry with the given key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Convert the entries to their wire representation.
    pub fn to_proto_entries(&self) -> Vec<Entry> {
        self.entries
            .iter()
            .map(|(k, v)| Entry {
                key: k.clone(),
                value: v.clone(),
            })
            .collect()
    }
}

impl From<&RateLimitDescriptor> for Descriptor {
    fn from(descriptor: &RateLimitDescriptor) -> Self {
        Self {
            entries: descriptor
                .entries
                .iter()
                .map(|e| (e.key.clone(), e.value.clone()))
                .collect(),
        }
    }
}

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}

/// A key that uniquely identifies a rate limit descriptor.
///
/// The key is composed of a namespace (the owning policy scope for local
/// buckets, the domain for shared counters) and all descriptor entries,
/// serialized in a consistent order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorKey {
    /// The namespace this descriptor belongs to
    pub namespace: String,
    /// Key-value pairs from the descriptor
    pub entries: Vec<(String, String)>,
}

impl DescriptorKey {
    /// Create a new descriptor key from a namespace and descriptor.
    pub fn new(namespace: &str, descriptor: &Descriptor) -> Self {
        Self {
            namespace: namespace.to_string(),
            entries: descriptor.entries.clone(),
        }
    }

    /// Convert the descriptor key to a string representation.
    ///
    /// This is useful for logging and debugging.
    pub fn to_string_key(&self) -> String {
        let entries_str: Vec<String> = self
            .entries
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        format!("{}:{}", self.namespace, entries_str.join(","))
    }
}

impl std::fmt::Display for DescriptorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_key_creation() {
        let descriptor = Descriptor::new()
            .with_entry("source", "client_a")
            .with_entry("destination", "service_b");

        let key = DescriptorKey::new("vhost", &descriptor);

        assert_eq!(key.namespace, "vhost");
        assert_eq!(key.entries.len(), 2);
        assert_eq!(key.entries[0], ("source".to_string(), "client_a".to_string()));
        assert_eq!(key.entries[1], ("destination".to_string(), "service_b".to_string()));
    }

    #[test]
    fn test_descriptor_key_to_string() {
        let descriptor = Descriptor::new().with_entry("key1", "value1");

        let key = DescriptorKey::new("route:/api", &descriptor);
        assert_eq!(key.to_string_key(), "route:/api:key1=value1");
    }

    #[test]
    fn test_same_descriptor_in_different_scopes_differs() {
        let descriptor = Descriptor::new().with_entry("remote_address", "1.2.3.4");

        let vhost = DescriptorKey::new("vhost", &descriptor);
        let route = DescriptorKey::new("route:/api", &descriptor);

        assert_ne!(vhost, route);
        assert_eq!(vhost, DescriptorKey::new("vhost", &descriptor));
    }

    #[test]
    fn test_entry_order_is_significant() {
        let ab = Descriptor::new().with_entry("a", "1").with_entry("b", "2");
        let ba = Descriptor::new().with_entry("b", "2").with_entry("a", "1");

        assert_ne!(ab, ba);
        assert_eq!(ab.to_string(), "a=1,b=2");
        assert_eq!(ab.get("b"), Some("2"));
        assert_eq!(ab.get("c"), None);
    }

    #[test]
    fn test_from_proto_descriptor() {
        let proto = RateLimitDescriptor {
            entries: vec![Entry {
                key: "route".to_string(),
                value: "/api".to_string(),
            }],
            limit: None,
        };

        let descriptor = Descriptor::from(&proto);
        assert_eq!(descriptor.entries(), &[("route".to_string(), "/api".to_string())]);
        assert_eq!(descriptor.to_proto_entries(), proto.entries);
    }
}
