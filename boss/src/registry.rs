//! Builders that turn manifest entries into service descriptors.
//!
//! Each manifest entry names a `kind`; the registry finds the builder for
//! that kind and wraps it in a factory that reads the entry's settings from
//! the configuration handed over at start time.

use crate::config::{Config, ServiceSettings};
use crate::endpoint::EndpointService;
use crate::error::{Error, Result, ServiceError};
use crate::process::ProcessService;
use crate::service::{Service, ServiceDescriptor};
use std::sync::Arc;

/// Constructs services of one kind.
pub trait ServiceBuilder: Send + Sync {
    /// Kind name used in the manifest.
    fn kind(&self) -> &'static str;

    /// Build an instance from its settings.
    fn build(&self, name: &str, settings: &ServiceSettings)
        -> std::result::Result<Arc<dyn Service>, ServiceError>;
}

/// Builds [`ProcessService`]s.
pub struct ProcessBuilder;

impl ServiceBuilder for ProcessBuilder {
    fn kind(&self) -> &'static str {
        "process"
    }

    fn build(
        &self,
        name: &str,
        settings: &ServiceSettings,
    ) -> std::result::Result<Arc<dyn Service>, ServiceError> {
        Ok(Arc::new(ProcessService::from_settings(name, settings)?))
    }
}

/// Builds [`EndpointService`]s.
pub struct EndpointBuilder;

impl ServiceBuilder for EndpointBuilder {
    fn kind(&self) -> &'static str {
        "endpoint"
    }

    fn build(
        &self,
        name: &str,
        settings: &ServiceSettings,
    ) -> std::result::Result<Arc<dyn Service>, ServiceError> {
        Ok(Arc::new(EndpointService::from_settings(name, settings)?))
    }
}

/// Registry of service builders.
pub struct FactoryRegistry {
    builders: Vec<Arc<dyn ServiceBuilder>>,
}

impl Default for FactoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FactoryRegistry {
    /// Create a registry with the built-in kinds.
    pub fn new() -> Self {
        let mut registry = Self {
            builders: Vec::new(),
        };

        registry.register(Arc::new(ProcessBuilder));
        registry.register(Arc::new(EndpointBuilder));

        registry
    }

    /// Register a builder. A later builder for the same kind wins.
    pub fn register(&mut self, builder: Arc<dyn ServiceBuilder>) {
        self.builders.retain(|b| b.kind() != builder.kind());
        self.builders.push(builder);
    }

    /// Find the builder for a kind.
    pub fn find(&self, kind: &str) -> Option<Arc<dyn ServiceBuilder>> {
        self.builders.iter().find(|b| b.kind() == kind).cloned()
    }

    /// All registered kinds.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.builders.iter().map(|b| b.kind()).collect()
    }

    /// Descriptor for one manifest entry.
    pub fn descriptor(&self, name: &str, settings: &ServiceSettings) -> Result<ServiceDescriptor> {
        let builder = self.find(&settings.kind).ok_or_else(|| {
            Error::Configuration(format!(
                "service {} has unknown kind {} (known: {})",
                name,
                settings.kind,
                self.kinds().join(", ")
            ))
        })?;

        let key = name.to_string();
        let mut descriptor = ServiceDescriptor::new(name, move |config: &Config| {
            let settings = config
                .service(&key)
                .ok_or_else(|| ServiceError::failed(format!("{} is not declared", key)))?;
            builder.build(&key, settings)
        })
        .depends_on(settings.dependencies.iter().cloned())
        .with_priority(settings.priority)
        .required(settings.required);

        descriptor.start_timeout = settings.start_timeout;
        descriptor.stop_timeout = settings.stop_timeout;
        Ok(descriptor)
    }

    /// Descriptors for every manifest entry, by name.
    pub fn descriptors(&self, config: &Config) -> Result<Vec<ServiceDescriptor>> {
        config
            .services
            .iter()
            .map(|(name, settings)| self.descriptor(name, settings))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manifest() -> Config {
        let mut config = Config::default();
        let mut db = ServiceSettings::process("sleep 30");
        db.priority = 10;
        db.required = true;
        db.stop_timeout = Some(Duration::from_secs(4));
        config.services.insert("database".to_string(), db);

        let mut llm = ServiceSettings::endpoint("127.0.0.1:11434");
        llm.dependencies = vec!["database".to_string()];
        llm.priority = 40;
        config.services.insert("llm".to_string(), llm);
        config
    }

    #[test]
    fn test_descriptors_carry_settings() {
        let config = manifest();
        let descriptors = FactoryRegistry::new().descriptors(&config).unwrap();
        assert_eq!(descriptors.len(), 2);

        let db = &descriptors[0];
        assert_eq!(db.name, "database");
        assert_eq!(db.priority, 10);
        assert!(db.required);
        assert_eq!(db.stop_timeout, Some(Duration::from_secs(4)));

        let llm = &descriptors[1];
        assert!(llm.dependencies.contains("database"));
        assert!(!llm.required);
    }

    #[test]
    fn test_factory_builds_declared_kind() {
        let config = manifest();
        let registry = FactoryRegistry::new();

        let desc = registry.descriptor("llm", &config.services["llm"]).unwrap();
        let instance = (desc.factory)(&config).unwrap();
        let endpoint = instance.into_any().downcast::<EndpointService>().unwrap();
        assert_eq!(endpoint.address(), "127.0.0.1:11434");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut settings = ServiceSettings::process("x");
        settings.kind = "container".to_string();
        let err = FactoryRegistry::new().descriptor("asset_generation", &settings).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("container"));
    }

    #[test]
    fn test_factory_fails_when_entry_removed() {
        let config = manifest();
        let desc = FactoryRegistry::new()
            .descriptor("database", &config.services["database"])
            .unwrap();
        assert!((desc.factory)(&Config::default()).is_err());
    }
}
