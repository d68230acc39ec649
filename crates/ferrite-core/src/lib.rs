//! Core data structures for the Ferrite DAE engine.
//!
//! This crate provides the pieces every analysis shares:
//! - [`Topology`]: global unknown IDs for nodes and branch currents
//! - [`SparsityBuilder`] / [`SparsityPattern`]: the Jacobian pattern, built once
//!   from device stamps and addressed through opaque [`JacHandle`]s
//! - [`DaeMatrix`]: fixed-pattern sparse matrix used for dQ/dx and dF/dx
//! - [`SolutionSet`]: next/current/last solution, state and store vectors
//! - [`BreakPoint`]: discontinuity times the integrator must land on
//! - [`Communicator`]: collective reductions and restart pack/unpack buffers

pub mod breakpoint;
pub mod comm;
pub mod error;
pub mod matrix;
pub mod sparsity;
pub mod topology;
pub mod vectors;

pub use breakpoint::{BreakPoint, BreakPointKind};
pub use comm::{Communicator, PackBuffer, SerialComm, UnpackBuffer};
pub use error::{Error, Result};
pub use matrix::DaeMatrix;
pub use sparsity::{JacHandle, SparsityBuilder, SparsityPattern};
pub use topology::{StateSlot, StoreSlot, Topology, VarId, VarKind};
pub use vectors::{SolutionSet, wrms_norm, wrms_partial_sum};
