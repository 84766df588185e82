pub mod api_observability;
pub mod app_config;
pub mod pipeline;
pub mod scheduler;
pub mod storage;

pub use api_observability::{ApiConfig, ObservabilityConfig};
pub use app_config::AppConfig;
pub use pipeline::{PipelineConfig, RegistryConfig, RegistryEntry};
pub use scheduler::{MonitorConfig, SchedulerConfig};
pub use storage::{DatabaseBackend, DatabaseConfig, StoreBackend, StoreConfig};
