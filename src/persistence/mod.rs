//! Persistence layer: the relational store of runs, screens, steps, and
//! visits (`store.rs`), plus the per-app credential store (`credentials.rs`).
//!
//! Both are single-file SQLite databases opened once per run (store) or on
//! demand (credentials), matching the disk layout under `<session_dir>/database/`.

pub mod credentials;
pub mod store;

pub use credentials::{CredentialRecord, CredentialStore};
pub use store::{PersistenceStore, RunStatus, StepRecord, StepToInsert};
