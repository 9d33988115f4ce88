//! # Process Manager Service
//!
//! This crate runs the managed units and the simulation around them.
//!
//! ## Philosophy
//!
//! Units are managed explicitly with clear lifecycle states:
//! - Explicit lifecycle (not implicit stop/continue signals)
//! - Progress survives every pause (the program counter is persisted)
//! - One stop request per component tears the whole group down

pub mod descriptor;
pub mod state;
pub mod manager;
pub mod unit;

pub use descriptor::{ConfigError, SimulationConfig, UnitConfig};
pub use state::{SharedUnitState, UnitState};
pub use manager::{ProcessManager, ProcessManagerError, SimulationReport, UnitHandle, UnitReport};
pub use unit::{ManagedUnit, UnitError, UnitExit};
