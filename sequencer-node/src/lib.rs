//! Sequencer node
//!
//! Wires the ordering engine to the JetStream backend and feeds the rocket
//! projection with per-channel ordered events.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod rocket;
pub mod telemetry;

pub use rocket::{
    RocketError, RocketEvent, RocketProjection, RocketState, RocketStatus, SortField, SortOrder,
};
