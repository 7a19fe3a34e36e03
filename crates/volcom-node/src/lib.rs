pub mod advertiser;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod engine;
pub mod invite;
pub mod node;
pub mod role;
pub mod worker;

pub use config::NodeConfig;
pub use controller::{Controller, ControllerSession, ControllerSettings, DispatchError, Target};
pub use discovery::{CandidateSet, Discoverer, PresenceRecord};
pub use engine::{EngineError, Execution, ProcessEngine, ScriptEngine};
pub use node::{NodeHandle, start};
pub use role::{NodeRole, RevertCause, RoleError, RoleState, WorkerSlot};
