//! # Dipolar Compute
//!
//! Communication backends for the dipolar interaction operator. This crate
//! provides a [`Communicator`](comm::Communicator) trait that isolates the
//! numerical code from the transport connecting the partitions of an SPMD run.
//!
//! ## Available backends
//!
//! | Backend | Feature flag | Partitions |
//! |---------|-------------|------------|
//! | Serial | always | 1 |
//! | Threaded (in-process) | `threaded` (default) | any, one thread each |
//! | Distributed (MPI) | `mpi` | one per rank |

pub mod comm;
pub mod serial;

#[cfg(feature = "threaded")]
pub mod threaded;

#[cfg(feature = "mpi")]
pub mod distributed;

pub use comm::{CommError, CommInfo, CommKind, Communicator};
pub use serial::SerialComm;

#[cfg(feature = "threaded")]
pub use threaded::ThreadComm;

#[cfg(feature = "mpi")]
pub use distributed::MpiComm;
