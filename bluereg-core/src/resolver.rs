/*!
 * Identifier Resolver
 * MAC, hciN name or object path to a registered adapter
 */

use tracing::debug;

use crate::adapter::Adapter;
use crate::manager::DeviceManager;

/// Whether a failed lookup may trigger one adapter rescan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescanPolicy {
    Never,
    OnMiss,
}

impl DeviceManager {
    /// Resolve `identifier` (or the default adapter when `None`).
    ///
    /// With no identifier and no default, one scan runs to establish a
    /// default. Lookups try MAC, then name, then path. Under
    /// [`RescanPolicy::OnMiss`] a miss on an explicit identifier rescans
    /// once and retries.
    pub async fn resolve(&self, identifier: Option<&str>, policy: RescanPolicy) -> Option<Adapter> {
        let explicit = identifier.is_some();
        let identifier = match identifier {
            Some(identifier) => identifier.to_string(),
            None => {
                if self.shared.default_adapter.read().await.is_none() {
                    self.scan_adapters().await;
                }
                let default = self.shared.default_adapter.read().await.clone()?;
                default.as_str().to_string()
            }
        };

        if let Some(adapter) = self.lookup(&identifier).await {
            return Some(adapter);
        }
        if policy == RescanPolicy::Never || !explicit {
            return None;
        }

        debug!("Adapter {} not known, rescanning", identifier);
        self.scan_adapters().await;
        self.lookup(&identifier).await
    }

    /// [`resolve`](Self::resolve) with a rescan on miss.
    pub async fn get_adapter(&self, identifier: Option<&str>) -> Option<Adapter> {
        self.resolve(identifier, RescanPolicy::OnMiss).await
    }

    async fn lookup(&self, identifier: &str) -> Option<Adapter> {
        let adapters = &self.shared.adapters;
        if let Some(adapter) = adapters.get_by_mac(identifier).await {
            return Some(adapter);
        }
        if let Some(adapter) = adapters.get_by_name(identifier).await {
            return Some(adapter);
        }
        adapters.get_by_path(identifier).await
    }
}
