//! Replication: merge rules, snapshot building, conflict resolution, the
//! command protocol and its transports, leader election, and the client
//! synchronizer that ties them together.

pub mod coalesce;
pub mod conflict;
pub mod merge;
pub mod protocol;
pub mod snapshot;

mod executer;
mod leader;
mod synchronizer;
mod transport;
mod trigger;

pub use executer::{CommandExecuter, RetryPolicy};
pub use leader::LeaderElector;
pub use synchronizer::{PullReport, PushOutcome, StepReport, Synchronizer};
pub use transport::{Connection, Connector, MemoryConnector, WsConnector};
pub use trigger::SyncTrigger;
