pub mod api;
pub mod controller;
pub mod fscache;
pub mod manager;
pub mod pool;
pub mod specialize;

pub use controller::{ControllerClient, HttpControllerClient};
pub use fscache::{ExecutorType, FuncSvc, FunctionServiceCache, ObjectRef};
pub use manager::PoolManager;
pub use pool::{GenericPool, PoolConfig};
pub use specialize::SpecializeClient;
