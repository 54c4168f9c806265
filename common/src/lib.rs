//! Shared core of the door capture recorder: configuration, sensor
//! payloads, the event state machine and the snapshot archive locator.

pub mod archive;
pub mod config;
pub mod event;
pub mod signal;
