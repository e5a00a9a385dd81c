//! Bus objects and the path registry.
//!
//! A `BusObject` exposes a set of frozen interface descriptions at one
//! object path, with a handler per (interface, method). Handler coverage is
//! validated at registration time, not at call time. The `ObjectRegistry`
//! owns the path table and resolves inbound calls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use obus_msg::codec::Value;
use obus_msg::validation::{validate_object_path, ValidationError};

use crate::errors::{BusError, ErrorCode};
use crate::interface::InterfaceDescription;

// ============================================================================
// Handler Traits
// ============================================================================

/// Decoded context for one inbound method call.
#[derive(Debug, Clone)]
pub struct MethodContext {
    /// Unique name of the caller
    pub sender: String,
    /// Session the call arrived on (0 = sessionless)
    pub session_id: u32,
    pub path: String,
    pub interface: String,
    pub member: String,
    /// Arguments decoded per the method's input signature
    pub args: Vec<Value>,
}

/// A handler either replies with values (encoded per the method's output
/// signature) or raises a named error that travels verbatim to the caller.
pub type MethodResult = Result<Vec<Value>, BusError>;

/// Per-(interface, method) call handler.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(&self, ctx: MethodContext) -> MethodResult;
}

struct FnMethodHandler<F>(F);

#[async_trait]
impl<F, Fut> MethodHandler for FnMethodHandler<F>
where
    F: Fn(MethodContext) -> Fut + Send + Sync,
    Fut: Future<Output = MethodResult> + Send,
{
    async fn handle(&self, ctx: MethodContext) -> MethodResult {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a method handler.
pub fn method_handler<F, Fut>(f: F) -> Arc<dyn MethodHandler>
where
    F: Fn(MethodContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MethodResult> + Send + 'static,
{
    Arc::new(FnMethodHandler(f))
}

/// Property getter/setter for objects that declare properties.
#[async_trait]
pub trait PropertyHandler: Send + Sync {
    async fn get(&self, interface: &str, property: &str) -> Result<Value, BusError>;

    async fn set(&self, interface: &str, property: &str, value: Value) -> Result<(), BusError>;
}

// ============================================================================
// BusObject
// ============================================================================

/// Errors building or registering a bus object.
#[derive(Debug, Error)]
pub enum ObjectError {
    #[error(transparent)]
    Path(#[from] ValidationError),

    #[error("no handler for method '{interface}.{method}'")]
    MissingHandler { interface: String, method: String },

    #[error("handler for unknown method '{interface}.{method}'")]
    UnknownMethod { interface: String, method: String },

    #[error("interface '{0}' attached twice")]
    DuplicateInterface(String),

    #[error("object declares properties but has no property handler")]
    MissingPropertyHandler,
}

/// One exposed object: a path, its interfaces, and their handlers.
pub struct BusObject {
    path: String,
    interfaces: Vec<Arc<InterfaceDescription>>,
    handlers: HashMap<(String, String), Arc<dyn MethodHandler>>,
    property_handler: Option<Arc<dyn PropertyHandler>>,
    introspection_override: Option<String>,
}

impl std::fmt::Debug for BusObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusObject")
            .field("path", &self.path)
            .field("interfaces", &self.interfaces)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("property_handler", &self.property_handler.is_some())
            .field("introspection_override", &self.introspection_override)
            .finish()
    }
}

impl BusObject {
    /// Start building an object at `path`. The path is validated here.
    pub fn builder(path: &str) -> Result<BusObjectBuilder, ObjectError> {
        validate_object_path(path)?;
        Ok(BusObjectBuilder {
            path: path.to_string(),
            interfaces: Vec::new(),
            handlers: HashMap::new(),
            property_handler: None,
            introspection_override: None,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interfaces(&self) -> &[Arc<InterfaceDescription>] {
        &self.interfaces
    }

    pub fn interface(&self, name: &str) -> Option<&Arc<InterfaceDescription>> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    pub fn handler(&self, interface: &str, method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers
            .get(&(interface.to_string(), method.to_string()))
            .cloned()
    }

    pub fn property_handler(&self) -> Option<Arc<dyn PropertyHandler>> {
        self.property_handler.clone()
    }

    pub fn introspection_override(&self) -> Option<&str> {
        self.introspection_override.as_deref()
    }

    /// Whether any attached interface declares properties.
    pub fn has_properties(&self) -> bool {
        self.interfaces.iter().any(|i| !i.properties.is_empty())
    }
}

/// Builder for `BusObject`. Shape is validated in `build()`.
pub struct BusObjectBuilder {
    path: String,
    interfaces: Vec<Arc<InterfaceDescription>>,
    handlers: HashMap<(String, String), Arc<dyn MethodHandler>>,
    property_handler: Option<Arc<dyn PropertyHandler>>,
    introspection_override: Option<String>,
}

impl BusObjectBuilder {
    /// Attach a frozen interface.
    pub fn add_interface(mut self, iface: Arc<InterfaceDescription>) -> Self {
        self.interfaces.push(iface);
        self
    }

    /// Install the handler for one declared method.
    pub fn with_method_handler(
        mut self,
        interface: &str,
        method: &str,
        handler: Arc<dyn MethodHandler>,
    ) -> Self {
        self.handlers
            .insert((interface.to_string(), method.to_string()), handler);
        self
    }

    /// Install the property getter/setter.
    pub fn with_property_handler(mut self, handler: Arc<dyn PropertyHandler>) -> Self {
        self.property_handler = Some(handler);
        self
    }

    /// Replace the generated introspection XML.
    pub fn with_introspection_override(mut self, xml: impl Into<String>) -> Self {
        self.introspection_override = Some(xml.into());
        self
    }

    /// Validate shape and freeze.
    ///
    /// Every declared method needs a handler, every handler a declared
    /// method, and declared properties need a property handler.
    pub fn build(self) -> Result<BusObject, ObjectError> {
        let mut seen = Vec::new();
        for iface in &self.interfaces {
            if seen.contains(&iface.name) {
                return Err(ObjectError::DuplicateInterface(iface.name.clone()));
            }
            seen.push(iface.name.clone());

            for method in &iface.methods {
                if !self
                    .handlers
                    .contains_key(&(iface.name.clone(), method.name.clone()))
                {
                    return Err(ObjectError::MissingHandler {
                        interface: iface.name.clone(),
                        method: method.name.clone(),
                    });
                }
            }
        }

        for (iface_name, method_name) in self.handlers.keys() {
            let known = self
                .interfaces
                .iter()
                .find(|i| &i.name == iface_name)
                .map(|i| i.method(method_name).is_some())
                .unwrap_or(false);
            if !known {
                return Err(ObjectError::UnknownMethod {
                    interface: iface_name.clone(),
                    method: method_name.clone(),
                });
            }
        }

        let has_properties = self.interfaces.iter().any(|i| !i.properties.is_empty());
        if has_properties && self.property_handler.is_none() {
            return Err(ObjectError::MissingPropertyHandler);
        }

        Ok(BusObject {
            path: self.path,
            interfaces: self.interfaces,
            handlers: self.handlers,
            property_handler: self.property_handler,
            introspection_override: self.introspection_override,
        })
    }
}

// ============================================================================
// ObjectRegistry
// ============================================================================

/// Outcome of resolving an inbound call against the path table.
pub struct ResolvedCall {
    pub object: Arc<BusObject>,
    pub interface: Arc<InterfaceDescription>,
    pub method: crate::interface::MethodDef,
    pub handler: Arc<dyn MethodHandler>,
}

impl std::fmt::Debug for ResolvedCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCall")
            .field("object", &self.object)
            .field("interface", &self.interface)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// The per-attachment path table.
#[derive(Default)]
pub struct ObjectRegistry {
    objects: RwLock<HashMap<String, Arc<BusObject>>>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object. Fails if the path is already taken.
    pub fn register(&self, object: BusObject) -> Result<Arc<BusObject>, BusError> {
        let mut objects = self.objects.write();
        if objects.contains_key(object.path()) {
            return Err(BusError::with_message(
                ErrorCode::BusObjAlreadyExists,
                format!("an object is already registered at '{}'", object.path()),
            ));
        }
        let object = Arc::new(object);
        objects.insert(object.path().to_string(), Arc::clone(&object));
        Ok(object)
    }

    /// Unregister a path, detaching its handlers. Idempotent.
    pub fn unregister(&self, path: &str) -> Option<Arc<BusObject>> {
        self.objects.write().remove(path)
    }

    pub fn lookup(&self, path: &str) -> Option<Arc<BusObject>> {
        self.objects.read().get(path).cloned()
    }

    /// All registered paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.objects.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Direct and transitive descendants of `path` that host objects.
    pub fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let mut children: Vec<String> = self
            .objects
            .read()
            .keys()
            .filter(|p| p.starts_with(&prefix) && p.as_str() != path)
            .map(|p| p[prefix.len()..].to_string())
            .collect();
        children.sort();
        children
    }

    /// Resolve `(path, interface, member)` to a handler.
    ///
    /// Unknown path, unknown interface on a known path, and unknown member
    /// on a known interface are distinct errors.
    pub fn resolve(
        &self,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Result<ResolvedCall, BusError> {
        let object = self.lookup(path).ok_or_else(|| {
            BusError::with_message(
                ErrorCode::BusNoSuchObject,
                format!("no object at '{}'", path),
            )
        })?;

        let iface = object.interface(interface).ok_or_else(|| {
            BusError::with_message(
                ErrorCode::BusUnknownInterface,
                format!("object '{}' does not implement '{}'", path, interface),
            )
        })?;

        let method = iface.method(member).ok_or_else(|| {
            BusError::with_message(
                ErrorCode::BusObjectNoSuchMember,
                format!("interface '{}' has no method '{}'", interface, member),
            )
        })?;

        let handler = object
            .handler(interface, member)
            .ok_or_else(|| BusError::new(ErrorCode::BusObjectNoSuchMember))?;

        Ok(ResolvedCall {
            interface: Arc::clone(iface),
            method: method.clone(),
            handler,
            object,
        })
    }

    /// Drop every registration. Bulk teardown leaves zero residuals.
    pub fn clear(&self) {
        self.objects.write().clear();
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
