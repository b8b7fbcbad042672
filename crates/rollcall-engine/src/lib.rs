//! rollcall-engine — runs the face pipeline on a dedicated thread and
//! records attendance.
//!
//! Async callers talk to the engine through an [`EngineHandle`]; the engine
//! thread owns the pipeline and the SQLite [`Store`](store::Store).

pub mod config;
pub mod engine;
pub mod store;

pub use config::{Config, ConfigError};
pub use engine::{spawn_engine, spawn_with_store, AttendanceResult, EngineError, EngineHandle, EnrollResult};
pub use store::{AttendanceRecord, MarkOutcome, Store, StoreError, TemplateRecord};
