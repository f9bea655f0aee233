//! Framework builder.

use std::sync::Arc;
use std::time::Duration;

use trellis_client::{
    ClientConfig, CoordinationClient, CoordinationError, EnsembleProvider, FixedEnsembleProvider,
    HandleFactory, Result, RetryPolicy,
};

use crate::framework::Framework;
use crate::temp::TempFramework;

/// Builder for [`Framework`] and [`TempFramework`].
///
/// # Examples
///
/// ```rust,ignore
/// use trellis_framework::FrameworkBuilder;
/// use std::time::Duration;
///
/// let framework = FrameworkBuilder::new()
///     .connect_string("zk1:2181,zk2:2181")
///     .handle_factory(factory)
///     .session_timeout(Duration::from_secs(30))
///     .build()?;
/// framework.start().await?;
/// ```
#[derive(Clone)]
pub struct FrameworkBuilder {
    connect_string: Option<String>,
    ensemble_provider: Option<Arc<dyn EnsembleProvider>>,
    handle_factory: Option<Arc<dyn HandleFactory>>,
    session_timeout: Duration,
    connection_timeout: Duration,
    retry_policy: Arc<dyn RetryPolicy>,
    can_be_read_only: bool,
}

impl Default for FrameworkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameworkBuilder {
    pub fn new() -> Self {
        Self::from_config(&ClientConfig::default())
    }

    /// Start from a client configuration.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            connect_string: config.connect_string.clone(),
            ensemble_provider: None,
            handle_factory: None,
            session_timeout: config.session_timeout,
            connection_timeout: config.connection_timeout,
            retry_policy: Arc::new(config.retry_policy()),
            can_be_read_only: config.can_be_read_only,
        }
    }

    /// Use a fixed ensemble.
    pub fn connect_string(mut self, connect_string: impl Into<String>) -> Self {
        self.connect_string = Some(connect_string.into());
        self
    }

    /// Use a provider for the ensemble. Takes precedence over a connect
    /// string.
    pub fn ensemble_provider(mut self, provider: Arc<dyn EnsembleProvider>) -> Self {
        self.ensemble_provider = Some(provider);
        self
    }

    pub fn handle_factory(mut self, factory: Arc<dyn HandleFactory>) -> Self {
        self.handle_factory = Some(factory);
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn can_be_read_only(mut self, enabled: bool) -> Self {
        self.can_be_read_only = enabled;
        self
    }

    /// Build an unstarted framework.
    pub fn build(&self) -> Result<Framework> {
        let factory = self
            .handle_factory
            .clone()
            .ok_or_else(|| CoordinationError::Config("handle factory is required".into()))?;

        let provider = match (&self.ensemble_provider, &self.connect_string) {
            (Some(provider), _) => provider.clone(),
            (None, Some(connect_string)) => {
                Arc::new(FixedEnsembleProvider::new(connect_string.clone()))
            }
            (None, None) => {
                return Err(CoordinationError::Config(
                    "connect string or ensemble provider is required".into(),
                ));
            }
        };

        let client = CoordinationClient::new(
            factory,
            provider,
            self.session_timeout,
            self.connection_timeout,
            self.retry_policy.clone(),
            self.can_be_read_only,
        );
        Ok(Framework::new(client))
    }

    /// Build a framework that connects on demand and disconnects after
    /// `inactive_threshold` without use.
    pub fn build_temp(self, inactive_threshold: Duration) -> Result<TempFramework> {
        // surface configuration errors now rather than on first use
        self.build()?;
        Ok(TempFramework::new(self, inactive_threshold))
    }
}
