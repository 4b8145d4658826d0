//! `s8r-runtime` – Process Wiring
//!
//! Everything an embedding process needs around the synchronous kernel.
//!
//! # Modules
//!
//! - [`runtime`] – [`Runtime`]: builds the [`Kernel`][s8r_kernel::Kernel] on
//!   top of an [`EventPublisher`][s8r_middleware::EventPublisher], spawns
//!   the dispatcher, and drives persistence off the caller's path.
//! - [`persistence`] – the [`PersistencePort`] plus in-memory and
//!   JSON-file backends.
//! - [`config`] – [`RuntimeConfig`], loaded from `~/.s8r/config.toml` with
//!   `S8R_*` environment overrides.
//! - [`telemetry`] – [`init_tracing`]: installs the `tracing` subscriber with
//!   an optional OTLP span exporter.

pub mod config;
pub mod persistence;
pub mod runtime;
pub mod telemetry;

pub use config::{ConfigError, RuntimeConfig};
pub use persistence::{FilePersistence, InMemoryPersistence, PersistenceError, PersistencePort};
pub use runtime::{Runtime, RuntimeBuilder};
pub use telemetry::{TracerProviderGuard, init_tracing};
