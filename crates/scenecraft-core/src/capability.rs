//! Capability discovery and filtering
//!
//! The external tool provider exposes a discoverable set of named operations
//! against the 3D engine. [`CapabilityRegistry`] discovers them, removes the
//! names in the session's [`ExclusionSet`], and hands the remainder to the
//! tool agent. Exclusions are a scope boundary: marketplace search/download
//! and long-running generation jobs are never offered to a stage.

use crate::error::PipelineError;
use crate::guard::CallGuard;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const DISCOVERY_TARGET: &str = "capability discovery";

/// Capabilities denied by default
pub const STANDARD_EXCLUSIONS: [&str; 8] = [
    "get_hyper3d_status",
    "get_sketchfab_status",
    "search_sketchfab_models",
    "download_sketchfab_models",
    "generate_hyper3d_model_via_text",
    "generate_hyper3d_model_via_images",
    "poll_rodin_job_status",
    "import_generated_asset",
];

/// One externally provided operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Operation name, the only identity this system relies on
    pub name: String,
    /// Human readable description, forwarded to the model
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments
    #[serde(default = "empty_schema")]
    pub input_schema: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl CapabilityDescriptor {
    /// Create descriptor with an empty argument schema
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_schema: empty_schema(),
        }
    }

    /// With description
    #[inline]
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// With argument schema
    #[inline]
    #[must_use]
    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = schema;
        self
    }
}

/// Result of invoking a capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityOutput {
    /// Concatenated text content
    pub text: String,
    /// Provider flagged the invocation as failed
    pub is_error: bool,
}

impl CapabilityOutput {
    #[inline]
    #[must_use]
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    #[inline]
    #[must_use]
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

/// Errors reported by a capability provider
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Subprocess could not be started
    #[error("failed to launch provider: {0}")]
    Launch(String),

    /// Transport or protocol failure
    #[error("provider transport error: {0}")]
    Transport(String),

    /// Unknown capability name
    #[error("unknown capability: {0}")]
    UnknownCapability(String),
}

/// External tool provider
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// List the operations currently exposed
    async fn discover(&self) -> Result<Vec<CapabilityDescriptor>, ProviderError>;

    /// Invoke one operation by name
    async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<CapabilityOutput, ProviderError>;
}

/// Static set of denied capability names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExclusionSet(BTreeSet<String>);

impl ExclusionSet {
    /// Empty exclusion set
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The standard marketplace/generation exclusions
    #[must_use]
    pub fn standard() -> Self {
        STANDARD_EXCLUSIONS.iter().map(|s| (*s).to_string()).collect()
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<String> for ExclusionSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Remove excluded capabilities, keeping discovery order
#[must_use]
pub fn filter(
    descriptors: Vec<CapabilityDescriptor>,
    excluded: &ExclusionSet,
) -> Vec<CapabilityDescriptor> {
    descriptors
        .into_iter()
        .filter(|d| !excluded.contains(&d.name))
        .collect()
}

/// Discovery + filtering front of a capability provider
pub struct CapabilityRegistry {
    provider: Arc<dyn CapabilityProvider>,
    excluded: ExclusionSet,
    cache_per_session: bool,
    cached: Mutex<Option<Vec<CapabilityDescriptor>>>,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("excluded", &self.excluded)
            .field("cache_per_session", &self.cache_per_session)
            .finish_non_exhaustive()
    }
}

impl CapabilityRegistry {
    /// Create registry over a provider
    #[must_use]
    pub fn new(provider: Arc<dyn CapabilityProvider>, excluded: ExclusionSet) -> Self {
        Self {
            provider,
            excluded,
            cache_per_session: false,
            cached: Mutex::new(None),
        }
    }

    /// Discover once per session instead of once per stage entry
    #[inline]
    #[must_use]
    pub fn with_session_cache(mut self, enabled: bool) -> Self {
        self.cache_per_session = enabled;
        self
    }

    /// Exclusion set applied at discovery
    #[inline]
    #[must_use]
    pub fn excluded(&self) -> &ExclusionSet {
        &self.excluded
    }

    /// Provider used for invocations
    #[inline]
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn CapabilityProvider> {
        &self.provider
    }

    /// Discover the raw capability list
    ///
    /// # Errors
    /// `PipelineError::Discovery` on transport failure, an empty list, or a
    /// descriptor without a name.
    pub async fn discover(&self) -> Result<Vec<CapabilityDescriptor>, PipelineError> {
        let descriptors = self
            .provider
            .discover()
            .await
            .map_err(|e| PipelineError::Discovery(e.to_string()))?;

        if descriptors.is_empty() {
            return Err(PipelineError::Discovery(
                "provider exposes no capabilities".to_string(),
            ));
        }
        if let Some(bad) = descriptors.iter().position(|d| d.name.trim().is_empty()) {
            return Err(PipelineError::Discovery(format!(
                "capability #{bad} has an empty name"
            )));
        }

        tracing::debug!(count = descriptors.len(), "discovered capabilities");
        Ok(descriptors)
    }

    /// Discover and filter, honouring the session cache
    ///
    /// Discovery runs under `guard` and stops when `cancel` fires.
    ///
    /// # Errors
    /// `PipelineError::Discovery` if discovery fails or nothing remains after
    /// exclusion, `PipelineError::Timeout` when the provider never answers,
    /// `PipelineError::Cancelled` on cancellation.
    pub async fn capabilities(
        &self,
        guard: &CallGuard,
        cancel: &CancellationToken,
    ) -> Result<Vec<CapabilityDescriptor>, PipelineError> {
        let mut cached = self.cached.lock().await;
        if self.cache_per_session {
            if let Some(list) = cached.as_ref() {
                return Ok(list.clone());
            }
        }

        let discovered = guard
            .call(DISCOVERY_TARGET, cancel, |_| self.discover())
            .await?;
        let total = discovered.len();
        let allowed = filter(discovered, &self.excluded);
        if allowed.is_empty() {
            return Err(PipelineError::Discovery(
                "no capabilities remain after exclusion".to_string(),
            ));
        }

        tracing::info!(
            discovered = total,
            allowed = allowed.len(),
            "capabilities filtered"
        );

        if self.cache_per_session {
            *cached = Some(allowed.clone());
        }
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::RetryPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ListProvider {
        names: Vec<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CapabilityProvider for ListProvider {
        async fn discover(&self) -> Result<Vec<CapabilityDescriptor>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.names.iter().map(|n| CapabilityDescriptor::new(*n)).collect())
        }

        async fn invoke(
            &self,
            name: &str,
            _arguments: serde_json::Value,
        ) -> Result<CapabilityOutput, ProviderError> {
            Err(ProviderError::UnknownCapability(name.to_string()))
        }
    }

    fn guard() -> CallGuard {
        CallGuard::new(
            Duration::from_millis(50),
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
        )
    }

    fn registry(names: Vec<&'static str>) -> (Arc<ListProvider>, CapabilityRegistry) {
        let provider = Arc::new(ListProvider {
            names,
            calls: AtomicUsize::new(0),
        });
        let registry = CapabilityRegistry::new(provider.clone(), ExclusionSet::standard());
        (provider, registry)
    }

    #[test]
    fn filter_keeps_order() {
        let list = vec![
            CapabilityDescriptor::new("get_scene_info"),
            CapabilityDescriptor::new("search_sketchfab_models"),
            CapabilityDescriptor::new("execute_blender_code"),
        ];
        let names: Vec<_> = filter(list, &ExclusionSet::standard())
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["get_scene_info", "execute_blender_code"]);
    }

    #[test]
    fn standard_set_has_all_names() {
        let set = ExclusionSet::standard();
        assert_eq!(set.len(), STANDARD_EXCLUSIONS.len());
        assert!(set.contains("poll_rodin_job_status"));
        assert!(!set.contains("execute_blender_code"));
    }

    #[tokio::test]
    async fn empty_discovery_is_an_error() {
        let (_, registry) = registry(vec![]);
        let err = registry.capabilities(&guard(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Discovery(_)));
    }

    #[tokio::test]
    async fn only_excluded_is_an_error() {
        let (_, registry) = registry(vec!["search_sketchfab_models", "get_hyper3d_status"]);
        let err = registry.capabilities(&guard(), &CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("no capabilities remain"));
    }

    #[tokio::test]
    async fn blank_name_is_invalid() {
        let (_, registry) = registry(vec!["execute_blender_code", " "]);
        assert!(matches!(
            registry.discover().await,
            Err(PipelineError::Discovery(_))
        ));
    }

    #[tokio::test]
    async fn discovers_every_time_without_cache() {
        let (provider, registry) = registry(vec!["execute_blender_code"]);
        registry.capabilities(&guard(), &CancellationToken::new()).await.unwrap();
        registry.capabilities(&guard(), &CancellationToken::new()).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn session_cache_discovers_once() {
        let (provider, registry) = registry(vec!["execute_blender_code"]);
        let registry = registry.with_session_cache(true);
        let first = registry.capabilities(&guard(), &CancellationToken::new()).await.unwrap();
        let second = registry.capabilities(&guard(), &CancellationToken::new()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    struct Hanging;

    #[async_trait]
    impl CapabilityProvider for Hanging {
        async fn discover(&self) -> Result<Vec<CapabilityDescriptor>, ProviderError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(vec![])
        }

        async fn invoke(
            &self,
            name: &str,
            _arguments: serde_json::Value,
        ) -> Result<CapabilityOutput, ProviderError> {
            Err(ProviderError::UnknownCapability(name.to_string()))
        }
    }

    #[tokio::test]
    async fn hung_discovery_times_out() {
        let registry = CapabilityRegistry::new(Arc::new(Hanging), ExclusionSet::standard());
        let err = registry
            .capabilities(&guard(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { .. }));
    }

    #[tokio::test]
    async fn hung_discovery_observes_cancellation() {
        let registry = CapabilityRegistry::new(Arc::new(Hanging), ExclusionSet::standard());
        let slow = CallGuard::new(Duration::from_secs(3600), RetryPolicy::none());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = registry.capabilities(&slow, &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }
}
