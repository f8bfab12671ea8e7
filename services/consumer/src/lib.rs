//! Logflow Consumer Service
//!
//! Ships log records from Kafka into Elasticsearch. A [`Supervisor`] keeps one
//! worker per `*_logs` topic and discovers new topics at runtime through the
//! new-topic event topic, without a restart.
//!
//! ## Architecture
//!
//! ```text
//! new_topic_events ──▶ control worker ──▶ Supervisor ── spawns ──┐
//!                                                                 ▼
//! <app>_logs ───────────────────────────────────────────▶ logs worker
//!                                                                 │
//!                                                   Timber ◀──────┘
//!                                                     │
//!                                                     ▼
//!                                     Retrier ──▶ Elasticsearch
//!                                        │
//!                                        └── budget exhausted ──▶ halt all workers
//! ```
//!
//! A halted supervisor stays halted until `POST /resume` on the admin API.

pub mod api;
pub mod config;
pub mod retrier;
pub mod store;
pub mod supervisor;

pub use api::{create_router, start_api_server, AppState};
pub use config::Config;
pub use retrier::Retrier;
pub use store::{ElasticStore, StoreError, TimberStore};
pub use supervisor::{Supervisor, SupervisorError, SupervisorSettings, SupervisorState};
