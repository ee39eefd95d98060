// Service registry: name registration, category binding, runtime attach and
// request routing.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::protocol::{next_id, Response, ServiceUri, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};
use crate::schema::Schema;
use crate::BusError;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Messages and methods
// ---------------------------------------------------------------------------

/// An incoming request as seen by a handler. Replying consumes it.
#[derive(Debug)]
pub struct BusMessage {
    uri: ServiceUri,
    payload: Value,
    reply: oneshot::Sender<Value>,
}

impl BusMessage {
    /// Build a message together with the receiving end of its reply.
    pub fn new(uri: ServiceUri, payload: Value) -> (Self, oneshot::Receiver<Value>) {
        let (reply, rx) = oneshot::channel();
        (Self { uri, payload, reply }, rx)
    }

    pub fn uri(&self) -> &ServiceUri {
        &self.uri
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn reply(self, value: Value) -> Result<(), BusError> {
        self.reply.send(value).map_err(|_| BusError::ReplyFailed)
    }
}

/// Handler type: a bound closure invoked on the service's runtime.
pub type HandlerFn = Arc<dyn Fn(BusMessage) + Send + Sync>;

/// One entry of a category's method table.
#[derive(Clone)]
pub struct Method {
    name: String,
    schema: Option<Schema>,
    handler: HandlerFn,
}

impl Method {
    pub fn new(name: impl Into<String>, handler: impl Fn(BusMessage) + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            schema: None,
            handler: Arc::new(handler),
        }
    }

    /// Payloads failing `schema` are rejected before the handler runs.
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

struct ServiceState {
    token: u64,
    categories: HashMap<String, HashMap<String, Method>>,
    runtime: Option<Handle>,
}

#[derive(Default)]
struct Registry {
    services: HashMap<String, ServiceState>,
}

/// Shared handle to the bus. Cloning is cheap; all clones see the same
/// registry.
#[derive(Clone, Default)]
pub struct ServiceBus {
    registry: Arc<Mutex<Registry>>,
}

impl ServiceBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim a service name. The returned handle owns the registration.
    pub fn register_service(&self, name: &str) -> Result<ServiceHandle, BusError> {
        if name.is_empty() || name.contains('/') || name.chars().any(char::is_whitespace) {
            return Err(BusError::InvalidServiceName(name.to_string()));
        }

        let mut registry = self.lock();
        if registry.services.contains_key(name) {
            return Err(BusError::ServiceExists(name.to_string()));
        }
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        registry.services.insert(
            name.to_string(),
            ServiceState {
                token,
                categories: HashMap::new(),
                runtime: None,
            },
        );
        tracing::debug!("bus: registered service {}", name);

        Ok(ServiceHandle {
            bus: self.clone(),
            name: name.to_string(),
            token,
            released: false,
        })
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.lock().services.contains_key(name)
    }

    /// Route a request with a freshly generated id.
    pub async fn call(&self, uri: &str, params: Value) -> Result<Response, BusError> {
        self.dispatch(next_id(), uri, params).await
    }

    /// Route a request. Routing failures (bad URI, unknown or detached
    /// service) are errors; everything past routing is a `Response`.
    pub async fn dispatch(&self, id: u64, uri: &str, params: Value) -> Result<Response, BusError> {
        let target = ServiceUri::parse(uri)?;

        let (method, runtime) = {
            let registry = self.lock();
            let service = registry
                .services
                .get(&target.service)
                .ok_or_else(|| BusError::ServiceNotFound(target.service.clone()))?;
            let runtime = service
                .runtime
                .clone()
                .ok_or_else(|| BusError::NotAttached(target.service.clone()))?;
            let method = service
                .categories
                .get(&target.category)
                .and_then(|methods| methods.get(&target.method))
                .cloned();
            (method, runtime)
        };

        let Some(method) = method else {
            return Ok(Response::err(id, METHOD_NOT_FOUND, format!("unknown method: {}", uri)));
        };

        let payload = if params.is_null() {
            Value::Object(Default::default())
        } else {
            params
        };

        if let Some(schema) = &method.schema {
            if let Err(reason) = schema.validate(&payload) {
                tracing::warn!("bus: rejected {}: {}", uri, reason);
                return Ok(Response::err(id, INVALID_PARAMS, reason));
            }
        }

        let (message, reply) = BusMessage::new(target, payload);
        let handler = method.handler.clone();
        runtime.spawn(async move { handler(message) });

        match reply.await {
            Ok(result) => Ok(Response::ok(id, result)),
            Err(_) => Ok(Response::err(
                id,
                INTERNAL_ERROR,
                format!("{} finished without replying", uri),
            )),
        }
    }

    fn with_service<T>(
        &self,
        name: &str,
        token: u64,
        f: impl FnOnce(&mut ServiceState) -> Result<T, BusError>,
    ) -> Result<T, BusError> {
        let mut registry = self.lock();
        match registry.services.get_mut(name) {
            Some(service) if service.token == token => f(service),
            _ => Err(BusError::ServiceNotFound(name.to_string())),
        }
    }

    fn remove(&self, name: &str, token: u64) -> Result<(), BusError> {
        let mut registry = self.lock();
        match registry.services.get(name) {
            Some(service) if service.token == token => {
                registry.services.remove(name);
                tracing::debug!("bus: unregistered service {}", name);
                Ok(())
            }
            _ => Err(BusError::ServiceNotFound(name.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Service handle
// ---------------------------------------------------------------------------

/// Exclusive ownership of a registered service name. Dropping the handle
/// unregisters the service.
pub struct ServiceHandle {
    bus: ServiceBus,
    name: String,
    token: u64,
    released: bool,
}

impl ServiceHandle {
    /// Bind a method table under `category` (`/` for the root category).
    pub fn register_category(&self, category: &str, methods: Vec<Method>) -> Result<(), BusError> {
        let valid_path = category == "/"
            || (category.starts_with('/') && category[1..].split('/').all(|s| !s.is_empty()));
        if !valid_path {
            return Err(BusError::InvalidCategory(category.to_string()));
        }
        if methods.is_empty() {
            return Err(BusError::EmptyCategory(category.to_string()));
        }

        self.bus.with_service(&self.name, self.token, |service| {
            if service.runtime.is_some() {
                return Err(BusError::AlreadyAttached(self.name.clone()));
            }
            if service.categories.contains_key(category) {
                return Err(BusError::CategoryExists(category.to_string()));
            }
            let table = methods
                .into_iter()
                .map(|method| (method.name.clone(), method))
                .collect();
            service.categories.insert(category.to_string(), table);
            Ok(())
        })
    }

    /// Start routing requests to this service. Handlers run on `runtime`.
    pub fn attach(&self, runtime: &Handle) -> Result<(), BusError> {
        self.bus.with_service(&self.name, self.token, |service| {
            if service.runtime.is_some() {
                return Err(BusError::AlreadyAttached(self.name.clone()));
            }
            if service.categories.is_empty() {
                return Err(BusError::NoCategories(self.name.clone()));
            }
            service.runtime = Some(runtime.clone());
            tracing::info!("bus: service {} attached", self.name);
            Ok(())
        })
    }

    /// Client connection for outbound calls made on behalf of this service.
    pub fn private_connection(&self) -> Result<BusClient, BusError> {
        self.bus.with_service(&self.name, self.token, |service| {
            if service.runtime.is_none() {
                return Err(BusError::NotAttached(self.name.clone()));
            }
            Ok(BusClient {
                bus: self.bus.clone(),
                sender: self.name.clone(),
            })
        })
    }

    pub fn unregister(mut self) -> Result<(), BusError> {
        self.released = true;
        self.bus.remove(&self.name, self.token)
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.bus.remove(&self.name, self.token) {
                tracing::debug!("bus: drop of {}: {}", self.name, e);
            }
        }
    }
}

/// Outbound connection owned by a registered service.
#[derive(Clone)]
pub struct BusClient {
    bus: ServiceBus,
    sender: String,
}

impl BusClient {
    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub async fn call(&self, uri: &str, params: Value) -> Result<Response, BusError> {
        tracing::debug!("bus: {} -> {}", self.sender, uri);
        self.bus.call(uri, params).await
    }
}
