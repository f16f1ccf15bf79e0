use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::config::PanelConfig;
use crate::error::{PanelError, PanelResult};
use crate::protocol::ProtocolKind;
use super::adapter::{AdapterFactory, ProtocolAdapter};
use super::service::ServiceController;
use super::{anyconnect, ipsec, l2tp, ssh, wireguard};

/// Adapter registry - one adapter per protocol kind
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: BTreeMap<ProtocolKind, Arc<dyn ProtocolAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with an adapter for every protocol, all sharing `service`
    pub fn with_system_defaults(config: &PanelConfig, service: Arc<ServiceController>) -> PanelResult<Self> {
        let factories: [AdapterFactory; 5] = [
            ssh::create_adapter,
            l2tp::create_adapter,
            ipsec::create_adapter,
            wireguard::create_adapter,
            anyconnect::create_adapter,
        ];

        let mut registry = Self::new();
        for factory in factories {
            registry.register(factory(config, service.clone())?);
        }
        Ok(registry)
    }

    /// Register an adapter, replacing any previous one for the same kind
    pub fn register(&mut self, adapter: Arc<dyn ProtocolAdapter>) {
        info!("Registering protocol adapter: {}", adapter.kind());
        self.adapters.insert(adapter.kind(), adapter);
    }

    /// Adapter for `kind`
    pub fn get(&self, kind: ProtocolKind) -> PanelResult<Arc<dyn ProtocolAdapter>> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| PanelError::NotFound(format!("No adapter registered for {}", kind)))
    }

    /// Registered kinds in stable order
    pub fn kinds(&self) -> Vec<ProtocolKind> {
        self.adapters.keys().copied().collect()
    }
}
