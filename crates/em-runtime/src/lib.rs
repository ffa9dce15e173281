//! Cooperative scheduling for the emergence engine.
//!
//! Every `em_core::Periodic` component gets its own tokio tick loop under a
//! shared cancellation token. The `Manager` owns the component graph.

pub mod driver;
pub mod error;
pub mod handle;
pub mod manager;

pub use driver::FieldDriver;
pub use error::{Result, RuntimeError};
pub use handle::ComponentHandle;
pub use manager::Manager;
