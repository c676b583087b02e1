//! hive-services — master and worker building blocks.
//!
//! Everything here is runtime-agnostic state plus the secured transport;
//! `hived` wires it into tasks and sockets.

pub mod discovery;
pub mod dispatcher;
pub mod resources;
pub mod sandbox;
pub mod selector;
pub mod task_queue;
pub mod transport;
pub mod worker_registry;

pub use discovery::{Candidate, CandidateTable, DiscoveryPacket};
pub use dispatcher::{new_task_id, DispatchReport, Dispatcher, DispatcherSettings};
pub use resources::ResourceCollector;
pub use sandbox::{Sandbox, SandboxError, SandboxLimits, SandboxOutput};
pub use selector::{SelectError, Selector};
pub use task_queue::{QueueError, TaskCounts, TaskQueue, TaskRecord, TaskSpec, TaskStatus};
pub use transport::{Channel, NodeInfo, TlsIdentity, Transport, TransportError};
pub use worker_registry::{WorkerId, WorkerRegistry, WorkerSnapshot, WorkerStatus};
