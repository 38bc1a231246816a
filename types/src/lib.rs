//! Core domain types for Stratus.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer: the driver, the worker executable,
//! and the messaging substrate.

mod ids;
mod locator;
mod policy;
mod process;
mod worker;

pub use ids::{CancellationId, ClusterId, ManagerId, ProcessId, TaskId};
pub use locator::{AddressError, Locator, NodeAddress};
pub use policy::FaultPolicy;
pub use process::ProcessInfo;
pub use worker::{WorkerRecord, WorkerRef};
