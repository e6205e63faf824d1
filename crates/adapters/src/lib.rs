//! Ad platform adapters: one implementation of the uniform ad-operations
//! contract per platform, plus the registry that resolves them.

pub mod adapter;
pub mod google;
pub mod meta;
pub mod mock;
pub mod registry;
pub mod tiktok;
pub mod transport;

pub use adapter::*;
pub use google::GoogleAdsAdapter;
pub use meta::MetaAdsAdapter;
pub use mock::{native_metric_fields, DailyTotals, MockAdapter};
pub use registry::AdapterRegistry;
pub use tiktok::TikTokAdsAdapter;
pub use transport::{ApiRequest, ApiResponse, ApiTransport, HttpTransport, TransportError};
