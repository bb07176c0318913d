//! Service identity.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_NAMESPACE: &str = "public";
pub const DEFAULT_GROUP: &str = "DEFAULT_GROUP";

/// Separator between group and name in a grouped service name.
const GROUP_SEPARATOR: &str = "@@";

/// Logical service identity. Compared and hashed by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Service {
    pub namespace: String,
    pub group: String,
    pub name: String,
}

impl Service {
    pub fn new(namespace: impl Into<String>, group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            group: group.into(),
            name: name.into(),
        }
    }

    /// Service in the default namespace and group.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(DEFAULT_NAMESPACE, DEFAULT_GROUP, name)
    }

    /// `group@@name`
    pub fn grouped_name(&self) -> String {
        format!("{}{}{}", self.group, GROUP_SEPARATOR, self.name)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.grouped_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grouped_name() {
        let svc = Service::new("prod", "payments", "ledger");
        assert_eq!(svc.grouped_name(), "payments@@ledger");
        assert_eq!(svc.to_string(), "prod/payments@@ledger");
    }

    #[test]
    fn test_value_equality() {
        assert_eq!(Service::named("orders"), Service::new("public", "DEFAULT_GROUP", "orders"));
        assert_ne!(Service::named("orders"), Service::new("prod", "DEFAULT_GROUP", "orders"));
    }
}
