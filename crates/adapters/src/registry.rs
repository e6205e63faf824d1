//! Adapter registry: resolves the adapter for a platform and checks that
//! it supports the requested operation.

use std::collections::HashMap;
use std::sync::Arc;

use campaign_core::clock::Clock;
use campaign_core::config::PlatformsConfig;
use campaign_core::error::{CoreError, CoreResult, PlatformError};
use campaign_core::types::Platform;
use tracing::info;

use crate::adapter::{Capability, PlatformAdapter};
use crate::google::GoogleAdsAdapter;
use crate::meta::MetaAdsAdapter;
use crate::tiktok::TikTokAdsAdapter;
use crate::transport::ApiTransport;

#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the production registry with one adapter per supported platform.
    pub fn from_config(
        config: &PlatformsConfig,
        transport: Arc<dyn ApiTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(
            GoogleAdsAdapter::new(transport.clone(), config.google.clone()).with_clock(clock.clone()),
        ));
        registry.register(Arc::new(
            MetaAdsAdapter::new(transport.clone(), config.meta.clone()).with_clock(clock.clone()),
        ));
        registry.register(Arc::new(
            TikTokAdsAdapter::new(transport, config.tiktok.clone()).with_clock(clock),
        ));
        info!(adapter_count = registry.adapters.len(), "adapter registry initialized");
        registry
    }

    /// Register an adapter, replacing any previous one for its platform.
    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    pub fn get(&self, platform: Platform) -> CoreResult<Arc<dyn PlatformAdapter>> {
        self.adapters
            .get(&platform)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("no adapter registered for {platform}")))
    }

    /// Resolve the adapter and fail with `PlatformIncompatibility` when it
    /// does not support `capability`.
    pub fn require(
        &self,
        platform: Platform,
        capability: Capability,
    ) -> CoreResult<Arc<dyn PlatformAdapter>> {
        let adapter = self.get(platform)?;
        if !adapter.supports(capability) {
            return Err(PlatformError::PlatformIncompatibility {
                platform,
                operation: format!("{capability:?}"),
            }
            .into());
        }
        Ok(adapter)
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.adapters.keys().copied().collect();
        platforms.sort_by_key(|p| p.slug());
        platforms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAdapter;

    #[test]
    fn test_unregistered_platform_is_not_found() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(MockAdapter::new(Platform::Meta)));

        assert!(registry.get(Platform::Meta).is_ok());
        assert!(matches!(
            registry.get(Platform::Google),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_missing_capability_is_incompatibility() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(
            MockAdapter::new(Platform::Tiktok).with_capabilities(vec![Capability::FetchMetrics]),
        ));

        assert!(registry.require(Platform::Tiktok, Capability::FetchMetrics).is_ok());
        let err = registry
            .require(Platform::Tiktok, Capability::CreateCampaign)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            CoreError::Platform(PlatformError::PlatformIncompatibility { .. })
        ));
    }

    #[test]
    fn test_from_config_registers_all_platforms() {
        let transport = Arc::new(crate::transport::scripted::ScriptedTransport::new());
        let clock = Arc::new(campaign_core::clock::SystemClock);
        let registry = AdapterRegistry::from_config(&PlatformsConfig::default(), transport, clock);
        assert_eq!(registry.platforms().len(), 3);
        for platform in Platform::ALL {
            assert_eq!(registry.get(platform).unwrap().platform(), platform);
        }
    }
}
