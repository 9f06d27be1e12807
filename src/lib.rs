#![cfg_attr(docsrs, feature(doc_cfg))]
//! # basenbridge_lib
//!
//! Bridges a Daren BMS master to an SNS/Ho01 slave device. Both speak
//! BASEN-style ASCII-hex frames over RS-485, with different field layouts.
//! The bridge answers the master's polls on behalf of the slave: it queries
//! the slave with its native telemetry command, remaps the reply into the
//! Daren layout and sends it back within the polling window.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `basenbridge` command-line tool.
//! - `tokio-serial-async`: Enables [`link::SerialLink`], opening the links with `tokio-serial`.
//! - `bin-dependencies`: Enables all features required by the `basenbridge` binary executable.

/// The bridge controller.
pub mod bridge;
/// Runtime configuration.
pub mod config;
/// Contains error types for the library.
mod error;
/// Opening and writing the serial links.
pub mod link;
/// Frame level protocol: checksums, classification and frame building.
pub mod protocol;
/// Terminator delimited frame assembly.
pub mod reader;
/// Telemetry queries against the slave device.
pub mod slave;
/// Field remapping between the two payload layouts.
pub mod translate;

pub use error::{Error, Result};
