//! Name → handler registries for orchestrations and activities.
//!
//! Registries are immutable once built. Lookups for unregistered names are
//! logged at debug level with the registry's contents to make wiring
//! mistakes easy to spot.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{ActivityContext, ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::_typed_codec::{Codec, Json};
use crate::{ActivityError, OrchestrationContext, RetryPolicy};

pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, Arc<H>>>,
}

// Manual Clone impl since H: ?Sized doesn't auto-derive Clone
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn builder_from(reg: &Registry<H>) -> RegistryBuilder<H> {
        RegistryBuilder {
            map: reg.inner.as_ref().clone(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        let found = self.inner.get(name).cloned();
        if found.is_none() {
            self.log_registry_miss(name);
        }
        found
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    fn log_registry_miss(&self, name: &str) {
        tracing::debug!(
            target: "durable_pipeline::runtime::registry",
            requested_name = %name,
            registered = ?self.list_names(),
            "registry lookup miss"
        );
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    fn insert(&mut self, name: String, handler: Arc<H>) {
        if name.trim().is_empty() {
            self.errors.push("handler name must not be empty".to_string());
            return;
        }
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate registration: {name}"));
            return;
        }
        self.map.insert(name, handler);
    }

    /// Copy every entry of `other` into this builder. Name clashes are errors.
    pub fn merge_registry(mut self, other: Registry<H>) -> Self {
        for (name, handler) in other.inner.iter() {
            self.insert(name.clone(), Arc::clone(handler));
        }
        self
    }

    /// Build, keeping the first registration for duplicated names.
    ///
    /// Use [`build_result`](Self::build_result) to fail on wiring errors instead.
    pub fn build(self) -> Registry<H> {
        for err in &self.errors {
            tracing::warn!(target: "durable_pipeline::runtime::registry", error = %err, "ignoring invalid registration");
        }
        Registry {
            inner: Arc::new(self.map),
        }
    }

    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(Registry {
                inner: Arc::new(self.map),
            })
        } else {
            Err(self.errors.join("; "))
        }
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnOrchestration::new(f)));
        self
    }

    /// Register with JSON-decoded input and JSON-encoded output. Inputs that
    /// do not decode as `In` are rejected by `validate` before the first pass.
    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: OrchestrationContext, input: String| {
            let f = Arc::clone(&f);
            async move {
                let decoded: In = Json::decode(&input)?;
                let out: Out = f(ctx, decoded).await?;
                Json::encode(&out)
            }
        };
        let validator = |input: &str| Json::decode::<In>(input).map(|_| ());
        self.insert(
            name.into(),
            Arc::new(FnOrchestration::new(wrapper).with_validator(validator)),
        );
        self
    }

    pub fn register_handler(mut self, name: impl Into<String>, handler: Arc<dyn OrchestrationHandler>) -> Self {
        self.insert(name.into(), handler);
        self
    }
}

impl ActivityRegistryBuilder {
    /// Register a closure. `Err` strings are retryable failures.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: ActivityContext, input: String| {
            let f = Arc::clone(&f);
            async move { f(ctx, input).await.map_err(ActivityError::from) }
        };
        self.insert(name.into(), Arc::new(FnActivity::new(wrapper)));
        self
    }

    /// Register a closure that classifies its own failures.
    pub fn register_classified<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ActivityError>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnActivity::new(f)));
        self
    }

    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: ActivityContext, input: String| {
            let f = Arc::clone(&f);
            async move {
                // Undecodable input will not get better on retry.
                let decoded: In = Json::decode(&input).map_err(ActivityError::permanent)?;
                let out = f(ctx, decoded).await.map_err(ActivityError::from)?;
                Json::encode(&out).map_err(ActivityError::permanent)
            }
        };
        self.insert(name.into(), Arc::new(FnActivity::new(wrapper)));
        self
    }

    pub fn register_handler(mut self, name: impl Into<String>, handler: Arc<dyn ActivityHandler>) -> Self {
        self.insert(name.into(), handler);
        self
    }

    /// Override the runtime's default retry policy for one activity.
    pub fn with_retry_policy(mut self, name: &str, policy: RetryPolicy) -> Self {
        match self.map.remove(name) {
            Some(inner) => {
                self.map
                    .insert(name.to_string(), Arc::new(RetryOverride { inner, policy }));
            }
            None => self
                .errors
                .push(format!("retry policy for unregistered activity: {name}")),
        }
        self
    }
}

struct RetryOverride {
    inner: Arc<dyn ActivityHandler>,
    policy: RetryPolicy,
}

#[async_trait::async_trait]
impl ActivityHandler for RetryOverride {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, ActivityError> {
        self.inner.invoke(ctx, input).await
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(self.policy.clone())
    }
}
