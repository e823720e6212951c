//! # Tessera
//!
//! The catalog processing service built on `tessera-core`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     apps/tessera (THE BINARY)                   │
//! │                                                                 │
//! │  ┌─────────────┐    ┌──────────────────┐    ┌───────────────┐  │
//! │  │  Providers  │───▶│ ProcessingEngine │───▶│  Processors   │  │
//! │  │ (locations) │    │  (tokio workers) │    │ (orchestrator)│  │
//! │  └──────┬──────┘    └────────┬─────────┘    └───────────────┘  │
//! │         │                    │                                  │
//! │         └────────────────────┤                                  │
//! │                              ▼                                  │
//! │                      ┌───────────────┐                          │
//! │                      │ tessera-core  │                          │
//! │                      │  (THE STORE)  │                          │
//! │                      └───────────────┘                          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod cli;
pub mod config;
pub mod engine;
pub mod logging;
pub mod processing;
pub mod providers;

pub use config::TesseraConfig;
pub use engine::{EngineConfig, EngineHandle, ProcessingEngine};
pub use processing::{CatalogProcessor, DefaultOrchestrator, ProcessorContext, ProcessorError};
pub use providers::{ConfigLocationProvider, LocationStoreProvider, location_entity};
