//! Process-level wiring and the background worker supervisor.

pub mod services;
pub mod worker;

pub use services::{InsightsServices, InsightsServicesBuilder};
pub use worker::WorkerRuntime;
