// src/lib.rs
pub mod cache;
pub mod cli;
pub mod facade;
pub mod fill;
pub mod native;
pub mod sensor_cache;
pub mod subscription;
pub mod transport;

// Re-export tracing for use in other modules
pub use tracing;

// Re-export for tests
pub use cache::{CacheCoordinator, CacheRequest, Dispatch, FailurePolicy, Observe};
pub use facade::{ApiError, SensorApi, SensorQuery, TimeSetting, TotalQuery};
pub use fill::{fill_day, fill_flex, fill_week, fill_year, SparseSeries, TimeSlotSeries};
pub use sensor_cache::{CachedValue, Hooks, SensorCache};
pub use subscription::{handler, Handler, HandlerError, SubscriptionRegistry};
