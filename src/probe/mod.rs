// Copyright (c) The rdt-probe Authors
// SPDX-License-Identifier: Apache-2.0

//! The probe: the per-direction connection-establishment and
//! liveness state machine described in spec.md §3-§4. Split the way the
//! design doc splits it — states, the command queue, the per-endpoint
//! records, the pure transition functions, and the thread that drives them
//! each get their own module.

pub mod command;
pub mod driver;
pub mod endpoint;
pub mod fsm;
pub mod state;

pub use command::{DriverCommand, ManagerOutcome};
pub use driver::{Driver, LocalIdentity};
pub use endpoint::{CodecKind, Direction, ProbeEndpoint};
pub use state::ProbeState;
