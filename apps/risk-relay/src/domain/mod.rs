//! Domain Layer - Risk model types and the formula engine.
//!
//! Pure types with no I/O: the config-tree format risk files are written
//! in, the expression language, market state and compiled portfolios.

/// Ordered nested `key = value` documents.
pub mod config_tree;

/// Formula compiler and evaluator.
pub mod expression;

/// Securities, positions and upstream event payloads.
pub mod market;

/// Portfolios, risk definitions and reports.
pub mod portfolio;
