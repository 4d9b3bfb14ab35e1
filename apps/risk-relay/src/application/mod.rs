//! Application Layer - Use cases and port definitions.
//!
//! Ports describe the file store and scripting collaborators; services
//! hold the risk model and compile risk files into portfolios.

/// Port interfaces for external collaborators.
pub mod ports;

/// Application services for portfolio construction and recompute.
pub mod services;
