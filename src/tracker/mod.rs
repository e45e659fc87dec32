//! Client-side heatmap tracker: samples pointer and scroll events on one root
//! element and ships them to the ingestion endpoint in small batches.

pub mod delivery;
pub mod engine;
pub mod session;

pub use delivery::{BEACON_QUEUE_DEPTH, Delivery, DeliveryError, HttpDelivery, deliver};
pub use engine::{
    HeatmapTracker, PointerEvent, Rect, ScrollMetrics, TrackedRoot, TrackerOptions,
};
pub use session::{MemorySessionStorage, SessionStorage, StorageError, resolve_session_id};
