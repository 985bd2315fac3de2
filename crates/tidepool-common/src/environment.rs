use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::metadata::ObjectMeta;

/// How many functions a single runtime container may host.
///
/// `Single` pools relabel a container out of the pool on specialization;
/// `Infinite` pools keep one container shared by every function of the
/// environment.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AllowedFunctionsPerContainer {
    #[default]
    Single,
    Infinite,
}

/// The language runtime image an environment runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeSpec {
    pub image: String,
}

/// Compute resources requested for the runtime container, as quantity
/// strings the orchestrator understands (e.g. "100m", "128Mi").
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    /// Environment interface version. v1 runtimes load a hard-coded path;
    /// v2+ runtimes accept a load request naming the file. v3 adds an
    /// explicit poolsize field.
    pub version: u32,

    pub runtime: RuntimeSpec,

    #[serde(default)]
    pub resources: Resources,

    #[serde(default)]
    pub allowed_functions_per_container: AllowedFunctionsPerContainer,

    /// Idle pool size. Ignored for v1/v2 environments, which predate the
    /// field and get a fixed legacy size.
    #[serde(default)]
    pub poolsize: u32,
}

/// A language runtime plus its pool-sizing policy, as declared through the
/// controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Environment {
    pub metadata: ObjectMeta,
    pub spec: EnvironmentSpec,
}
