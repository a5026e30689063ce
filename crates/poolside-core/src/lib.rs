// poolside-core: Equipment model, write coalescing and supervised connections.

pub mod coalesce;
pub mod config;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod model;
pub mod supervisor;

// ── Primary re-exports ──────────────────────────────────────────────
pub use coalesce::{ChangeSink, WriteCoalescer};
pub use config::{ControllerConfig, SupervisorConfig};
pub use controller::{Controller, Link};
pub use error::CoreError;
pub use metrics::{ConnectionMetrics, MetricsSnapshot};
pub use model::{AttributeMap, ModelUpdate, PoolModel, PoolObject, SystemInfo};
pub use supervisor::{Supervisor, SupervisorEvent, SupervisorState, SupervisorStatus};

// Wire-level types consumers need alongside the core surface.
pub use poolside_api::{
    ConnectionConfig, CorrelationPolicy, DEFAULT_PORT, HeartbeatConfig, ObjectEntry, Params,
};
