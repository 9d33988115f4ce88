//! # Core Types
//!
//! This crate defines the fundamental identifiers shared by every SchedSim
//! component.
//!
//! ## Philosophy
//!
//! - **Explicit over implicit**: A unit and a kernel are addressed by typed
//!   identities, never by raw integers that could be confused with indices.
//! - **Type safety first**: `UnitId` and `KernelId` cannot be mixed up.
//!
//! ## Key Types
//!
//! - [`UnitId`]: Stable identity of a managed unit
//! - [`KernelId`]: Addressable identity of a running scheduler core

pub mod ids;

pub use ids::{KernelId, UnitId};
