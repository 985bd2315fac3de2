pub mod environment;
pub mod function;
pub mod metadata;
pub mod telemetry;

pub use environment::{AllowedFunctionsPerContainer, Environment, EnvironmentSpec, Resources, RuntimeSpec};
pub use function::{Function, FunctionSpec, NamespacedName};
pub use metadata::ObjectMeta;
