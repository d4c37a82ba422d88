//! Process-wide transport context.

use actmesh_types::{ConfigError, InstanceId, TransportConfig};
use std::sync::Arc;

/// The local instance identity plus validated settings, shared by every
/// listener and client of one process.
#[derive(Debug, Clone)]
pub struct TransportContext {
    instance: InstanceId,
    settings: Arc<TransportConfig>,
}

impl TransportContext {
    /// Validate `settings` and bind them to `instance`.
    pub fn new(instance: InstanceId, settings: TransportConfig) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self {
            instance,
            settings: Arc::new(settings),
        })
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn settings(&self) -> &TransportConfig {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_settings_rejected() {
        let settings = TransportConfig {
            timeout_ms: 0,
            ..TransportConfig::default()
        };
        assert!(TransportContext::new(InstanceId::new("a"), settings).is_err());
    }

    #[test]
    fn test_context_is_shared() {
        let ctx = TransportContext::new(InstanceId::new("a"), TransportConfig::default()).unwrap();
        let copy = ctx.clone();
        assert_eq!(copy.instance().as_str(), "a");
        assert_eq!(copy.settings(), ctx.settings());
    }
}
