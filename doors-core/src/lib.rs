//! Doors client runtime core.
//! Host-driven: no I/O; host passes events and receives commands/effects.

pub mod backoff;
pub mod controller;
pub mod package;
pub mod reassembler;
pub mod report;
pub mod scope;
pub mod timer;
pub mod tracker;
pub mod wire;

pub use controller::{Command, Controller, ControllerConfig, ControllerTimer, PageState, Report, SessionId};
pub use package::{Call, Package, Payload, Seq};
pub use reassembler::Reassembler;
pub use report::{Gap, Upload};
pub use scope::{Effect, HookId, Policy, Runtime, ScopeSet, ScopeSpecError};
pub use timer::TimerToken;
pub use tracker::{ActionExecutor, Outcome, Results, Tracker};
pub use wire::{encode_frame, FormatError, PayloadType, WireEvent, WireParser};
