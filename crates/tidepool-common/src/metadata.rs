use serde::{Deserialize, Serialize};

/// Identity of a controller-managed object (environment, function, package).
///
/// Two objects with the same name but different uid are distinct; a deleted
/// and recreated environment must not be confused with its predecessor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

impl ObjectMeta {
    pub fn new(namespace: &str, name: &str, uid: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: uid.to_string(),
        }
    }

    /// Map key used wherever objects are cached by identity.
    pub fn cache_key(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.name, self.uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_includes_uid() {
        let a = ObjectMeta::new("default", "py", "uid-1");
        let b = ObjectMeta::new("default", "py", "uid-2");
        assert_eq!(a.cache_key(), "default/py/uid-1");
        assert_ne!(a.cache_key(), b.cache_key());
    }
}
