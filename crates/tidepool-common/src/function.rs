use serde::{Deserialize, Serialize};

use crate::metadata::ObjectMeta;

/// Namespace-qualified reference to another object (package, secret,
/// config map, environment).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    /// The package holding the user code archive.
    pub package: NamespacedName,

    /// Entry point the runtime loads out of the package.
    pub entrypoint: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<NamespacedName>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_maps: Vec<NamespacedName>,

    /// The environment this function runs in.
    pub environment: NamespacedName,
}

/// User code plus metadata, bound to an environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Function {
    pub metadata: ObjectMeta,
    pub spec: FunctionSpec,
}
