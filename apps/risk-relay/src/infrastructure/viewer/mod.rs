//! Viewer Side
//!
//! WebSocket sessions of risk viewers, the registry that tracks them and the
//! request types they send.

pub mod messages;
pub mod registry;
pub mod session;

pub use messages::{ViewerAction, ViewerRequest};
pub use registry::{ConnectionToken, SessionHandle, SessionRegistry};
pub use session::{RequestCanonicalizer, SessionContext, run_session};
