pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use error::{CoreError, CoreResult, Disposition, PlatformError, PlatformResult};
pub use event_bus::{NotificationEvent, NotificationKind, NotificationSink};
