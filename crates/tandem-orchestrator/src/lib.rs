//! Work-order execution engine: takes an approved plan, spawns pods per
//! phase, enforces time/contract budgets, and drives execution through to a
//! receipt.
//!
//! Also carries the mission/agent-team data model and spawn policy (`model`,
//! `reducer`, `agent_team`) that predate the execution engine and remain in
//! active use by `tandem-server`'s HTTP routes and agent-team runtime.

pub mod agent_team;
pub mod bus;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod contract;
pub mod engine;
pub mod error;
pub mod model;
pub mod model_client;
pub mod pause;
pub mod pod;
pub mod pod_pool;
pub mod receipt;
pub mod reducer;
pub mod scheduler;
pub mod tool_dispatcher;
pub mod types;
pub mod updates;

pub use agent_team::*;
pub use bus::*;
pub use checkpoint::*;
pub use clock::*;
pub use contract::*;
pub use engine::*;
pub use error::*;
pub use model::*;
pub use model_client::*;
pub use pause::*;
pub use pod::*;
pub use pod_pool::*;
pub use receipt::*;
pub use reducer::*;
pub use scheduler::*;
pub use tool_dispatcher::*;
pub use types::*;
pub use updates::*;
