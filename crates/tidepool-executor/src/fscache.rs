use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use tidepool_common::{Environment, ObjectMeta};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorType {
    Poolmgr,
}

/// Reference to an orchestrator object backing a function service, kept so
/// downstream cleanup can find what the executor created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub resource_version: String,
    pub uid: String,
}

/// The descriptor handed to the router: function identity plus its current
/// endpoint address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FuncSvc {
    /// Name of the backing pod.
    pub name: String,
    pub function: ObjectMeta,
    pub environment: Environment,
    /// `<podIP>:<runtimePort>` or a namespace-qualified service hostname.
    pub address: String,
    pub orchestrator_refs: Vec<ObjectRef>,
    pub executor: ExecutorType,
    pub ctime: DateTime<Utc>,
    pub atime: DateTime<Utc>,
}

/// Concurrency-safe cache of function → live endpoint bindings.
///
/// The executor writes on specialization; the router reads. Reaping of idle
/// services happens elsewhere; this keeps the access-time bookkeeping those
/// decisions need.
#[derive(Debug, Default)]
pub struct FunctionServiceCache {
    by_function: DashMap<String, FuncSvc>,
}

impl FunctionServiceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new binding keyed by function identity. A duplicate insert
    /// is a programming error: each specialization must target a function
    /// without a live service.
    pub fn add(&self, fsvc: FuncSvc) -> Result<()> {
        let key = fsvc.function.cache_key();
        match self.by_function.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                bail!(
                    "function service for {} already registered at {}",
                    existing.key(),
                    existing.get().address
                );
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(fsvc);
                Ok(())
            }
        }
    }

    /// Router-facing lookup; bumps the access time.
    pub fn get(&self, function: &ObjectMeta) -> Option<FuncSvc> {
        let mut entry = self.by_function.get_mut(&function.cache_key())?;
        entry.atime = Utc::now();
        Some(entry.clone())
    }

    pub fn touch(&self, function: &ObjectMeta) {
        if let Some(mut entry) = self.by_function.get_mut(&function.cache_key()) {
            entry.atime = Utc::now();
        }
    }

    pub fn len(&self) -> usize {
        self.by_function.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_function.is_empty()
    }
}
