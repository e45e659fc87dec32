pub mod app;
pub mod config;
pub mod errors;
pub mod grid;
pub mod handlers;
pub mod identity;
pub mod ingest;
pub mod models;
pub mod stats;
pub mod storage;
pub mod store;
pub mod state;
pub mod tracker;

pub use app::router;
pub use state::AppState;
pub use storage::{load_data, persist_data};
pub use store::run_compaction;
pub use store::AggregateStore;
