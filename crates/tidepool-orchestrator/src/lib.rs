pub mod kubernetes;
pub mod memory;
pub mod types;

pub use kubernetes::KubeOrchestrator;
pub use memory::MemoryOrchestrator;
pub use types::{
    selector_string, ContainerSpec, Deployment, HttpProbe, ImagePullPolicy, Labels, Orchestrator,
    Pod, PodPhase, PodTemplate, ReplicaSet, Service, VolumeMount,
};
