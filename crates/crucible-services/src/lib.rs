//! crucible-services — the job lifecycle subsystem.
//!
//! Queue adapter, pubsub bus, socket hub, job store, quota gate, the two
//! runners, and the worker loop that ties them together.

pub mod audit;
pub mod bus;
pub mod compile_runner;
pub mod deploy_runner;
pub mod directory;
pub mod hub;
pub mod job_store;
pub mod queue;
pub mod quota;
pub mod worker;

pub use audit::AuditHooks;
pub use bus::Bus;
pub use compile_runner::{CompileOutput, CompileRequest, CompileRunner};
pub use deploy_runner::{DeployRequest, DeployRunner};
pub use directory::Directory;
pub use hub::{ClientEvent, ServerEvent, SocketHub};
pub use job_store::{JobStore, ListFilter, Terminal, open_store};
pub use queue::{Claimed, Delivery, QueueAdapter};
pub use quota::QuotaGate;
pub use worker::WorkerContext;
