use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, RwLock},
};

use {async_trait::async_trait, serde_json::Value};

use atp_protocol::{AuthSpec, HttpToolMetadata, ParameterSpec, ToolAnnouncement};

use crate::error::{Error, Result};

/// Named arguments handed to a tool handler.
pub type ToolArgs = serde_json::Map<String, Value>;

/// Callable behind a registered tool.
///
/// Implemented for any `Fn(ToolArgs) -> impl Future<Output = anyhow::Result<Value>>`,
/// so most tools are plain async closures.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: ToolArgs) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(ToolArgs) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, args: ToolArgs) -> anyhow::Result<Value> {
        (self)(args).await
    }
}

/// Adapter running a synchronous function on the blocking thread pool.
struct BlockingHandler<F>(Arc<F>);

#[async_trait]
impl<F> ToolHandler for BlockingHandler<F>
where
    F: Fn(ToolArgs) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    async fn call(&self, args: ToolArgs) -> anyhow::Result<Value> {
        let f = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || f(args)).await?
    }
}

/// Declared type hint of a parameter. Informational only; values are not coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterDef {
    pub name: String,
    pub param_type: ParamType,
}

/// `(provider, scheme, inject_as)`: the handler receives the resolved token
/// under the `inject_as` argument name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequirement {
    pub provider: String,
    pub scheme: String,
    pub inject_as: String,
}

/// A registered tool. Immutable once built.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterDef>,
    pub required_parameters: Vec<String>,
    pub auth: Option<AuthRequirement>,
    handler: Arc<dyn ToolHandler>,
}

impl ToolDescriptor {
    pub fn builder(name: impl Into<String>) -> ToolBuilder {
        ToolBuilder {
            name: name.into(),
            description: String::new(),
            parameters: Vec::new(),
            required: Vec::new(),
            auth: None,
            handler: None,
        }
    }

    pub fn handler(&self) -> Arc<dyn ToolHandler> {
        Arc::clone(&self.handler)
    }

    /// Registration entry sent to the backend.
    pub fn announcement(&self) -> ToolAnnouncement {
        ToolAnnouncement {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self
                .parameters
                .iter()
                .map(|p| ParameterSpec {
                    name: p.name.clone(),
                    type_hint: p.param_type.as_str().into(),
                })
                .collect(),
            required_parameters: self.required_parameters.clone(),
            auth: self.auth.as_ref().map(|a| AuthSpec {
                provider: a.provider.clone(),
                kind: a.scheme.clone(),
                with: a.inject_as.clone(),
            }),
        }
    }

    /// Metadata block for the per-tool HTTP registration endpoint.
    pub fn http_metadata(&self) -> HttpToolMetadata {
        HttpToolMetadata {
            params: self.parameters.iter().map(|p| p.name.clone()).collect(),
            required_params: self.required_parameters.clone(),
            description: self.description.clone(),
            auth_provider: self.auth.as_ref().map(|a| a.provider.clone()),
            auth_type: self.auth.as_ref().map(|a| a.scheme.clone()),
            auth_with: self.auth.as_ref().map(|a| a.inject_as.clone()),
        }
    }

    /// `{function, description, params, required_params, auth_*}` view used by adapters.
    pub fn context(&self) -> Value {
        serde_json::json!({
            "function": self.name,
            "description": self.description,
            "params": self.parameters.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            "required_params": self.required_parameters,
            "auth_provider": self.auth.as_ref().map(|a| a.provider.as_str()),
            "auth_type": self.auth.as_ref().map(|a| a.scheme.as_str()),
            "auth_with": self.auth.as_ref().map(|a| a.inject_as.as_str()),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid(&self.name, "name must not be empty"));
        }

        let mut declared = HashSet::new();
        for p in &self.parameters {
            if p.name.trim().is_empty() {
                return Err(Error::invalid(&self.name, "parameter names must not be empty"));
            }
            if !declared.insert(p.name.as_str()) {
                return Err(Error::invalid(
                    &self.name,
                    format!("parameter '{}' declared twice", p.name),
                ));
            }
        }

        if let Some(missing) = self
            .required_parameters
            .iter()
            .find(|r| !declared.contains(r.as_str()))
        {
            return Err(Error::invalid(
                &self.name,
                format!("required parameter '{missing}' is not a declared parameter"),
            ));
        }

        if let Some(auth) = &self.auth {
            if auth.inject_as.trim().is_empty() {
                return Err(Error::invalid(&self.name, "auth injection target is empty"));
            }
            // The token is supplied by the injector; demanding it from callers is ambiguous.
            if self.required_parameters.contains(&auth.inject_as) {
                return Err(Error::invalid(
                    &self.name,
                    format!(
                        "auth token argument '{}' cannot also be a required parameter",
                        auth.inject_as
                    ),
                ));
            }
        }

        Ok(())
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .field("required_parameters", &self.required_parameters)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

/// Builder returned by [`ToolDescriptor::builder`].
pub struct ToolBuilder {
    name: String,
    description: String,
    parameters: Vec<ParameterDef>,
    required: Vec<String>,
    auth: Option<AuthRequirement>,
    handler: Option<Arc<dyn ToolHandler>>,
}

impl ToolBuilder {
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Declare an optional parameter.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, param_type: ParamType) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            param_type,
        });
        self
    }

    /// Declare a parameter and mark it required.
    #[must_use]
    pub fn required_param(self, name: impl Into<String>, param_type: ParamType) -> Self {
        let name = name.into();
        self.param(name.clone(), param_type).require(name)
    }

    /// Mark an already-declared parameter as required.
    #[must_use]
    pub fn require(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    #[must_use]
    pub fn auth(
        mut self,
        provider: impl Into<String>,
        scheme: impl Into<String>,
        inject_as: impl Into<String>,
    ) -> Self {
        self.auth = Some(AuthRequirement {
            provider: provider.into(),
            scheme: scheme.into(),
            inject_as: inject_as.into(),
        });
        self
    }

    #[must_use]
    pub fn handler(mut self, handler: impl ToolHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Use a synchronous function, run on the blocking pool.
    #[must_use]
    pub fn blocking_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(ToolArgs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(BlockingHandler(Arc::new(f))));
        self
    }

    pub fn build(self) -> Result<ToolDescriptor> {
        let handler = self
            .handler
            .ok_or_else(|| Error::invalid(&self.name, "no handler"))?;
        let descriptor = ToolDescriptor {
            name: self.name,
            description: self.description,
            parameters: self.parameters,
            required_parameters: self.required,
            auth: self.auth,
            handler,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    tools: HashMap<String, Arc<ToolDescriptor>>,
    order: Vec<String>,
}

/// Thread-safe name → descriptor map that remembers registration order.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<Inner>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tool. A replaced tool keeps its original position.
    pub fn register(&self, descriptor: ToolDescriptor) -> Result<()> {
        descriptor.validate()?;
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let name = descriptor.name.clone();
        if inner
            .tools
            .insert(name.clone(), Arc::new(descriptor))
            .is_none()
        {
            inner.order.push(name);
        }
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let removed = inner.tools.remove(name).is_some();
        if removed {
            inner.order.retain(|n| n != name);
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolDescriptor>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.tools.get(name).cloned()
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<ToolDescriptor>> {
        self.get(name).ok_or_else(|| Error::ToolNotFound {
            name: name.to_string(),
        })
    }

    /// Snapshot of all tools in registration order.
    pub fn list(&self) -> ToolList {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        ToolList {
            tools: inner
                .order
                .iter()
                .filter_map(|name| inner.tools.get(name).cloned())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .tools
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn announcements(&self) -> Vec<ToolAnnouncement> {
        self.list().iter().map(|t| t.announcement()).collect()
    }
}

/// Ordered snapshot returned by [`ToolRegistry::list`].
///
/// Iterating borrows the snapshot, so it can be walked any number of times.
/// Later registrations do not affect an existing snapshot.
#[derive(Debug, Clone, Default)]
pub struct ToolList {
    tools: Vec<Arc<ToolDescriptor>>,
}

impl ToolList {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ToolDescriptor>> {
        self.tools.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl<'a> IntoIterator for &'a ToolList {
    type IntoIter = std::slice::Iter<'a, Arc<ToolDescriptor>>;
    type Item = &'a Arc<ToolDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tools.iter()
    }
}
