//! Service and method descriptors.
//!
//! A `Service` is one registered instance plus a table of `MethodType`s built
//! at registration time. Each method descriptor knows how to materialize a
//! fresh argument (decoded from the request body) and a fresh zero-valued
//! reply, how to invoke the method, and how to encode the reply afterwards.
//! Types are erased behind `Box<dyn Any + Send>` so one table can hold methods
//! of any shape.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use hasten_core::error::{Result, RpcError};
use hasten_core::protocol::CodecType;

/// Type-erased argument or reply slot.
pub type Slot = Box<dyn Any + Send>;

type Invoke =
    Box<dyn Fn(&(dyn Any + Send + Sync), Slot, &mut (dyn Any + Send)) -> std::result::Result<(), String> + Send + Sync>;

/// A service type exposing RPC methods.
///
/// Implementors list their methods on the builder; the service name is the
/// type's own name (`ComputeS1` for `crate::services::ComputeS1`).
pub trait RpcService: Send + Sync + Sized + 'static {
    fn register_methods(methods: ServiceBuilder<Self>) -> ServiceBuilder<Self>;
}

/// One invocable method.
pub struct MethodType {
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    decode_argv: fn(CodecType, &[u8]) -> Result<Slot>,
    new_replyv: fn() -> Slot,
    encode_replyv: fn(CodecType, &(dyn Any + Send)) -> Result<Bytes>,
    invoke: Invoke,
    num_calls: AtomicU64,
}

impl MethodType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Fresh argument value decoded from a request body.
    pub fn decode_argv(&self, codec: CodecType, raw: &[u8]) -> Result<Slot> {
        (self.decode_argv)(codec, raw)
    }

    /// Fresh reply value in its zero/empty form.
    pub fn new_replyv(&self) -> Slot {
        (self.new_replyv)()
    }

    pub fn encode_replyv(&self, codec: CodecType, replyv: &(dyn Any + Send)) -> Result<Bytes> {
        (self.encode_replyv)(codec, replyv)
    }
}

fn decode_argv<A: DeserializeOwned + Send + 'static>(codec: CodecType, raw: &[u8]) -> Result<Slot> {
    let argv: A = codec.decode(raw)?;
    Ok(Box::new(argv))
}

fn new_replyv<R: Default + Send + 'static>() -> Slot {
    Box::new(R::default())
}

fn encode_replyv<R: Serialize + 'static>(codec: CodecType, replyv: &(dyn Any + Send)) -> Result<Bytes> {
    let r = replyv
        .downcast_ref::<R>()
        .ok_or_else(|| RpcError::Internal(format!("reply slot is not {}", type_name::<R>())))?;
    codec.encode(r)
}

/// A registered service: name, instance, and its methods.
pub struct Service {
    name: String,
    instance: Arc<dyn Any + Send + Sync>,
    methods: HashMap<String, Arc<MethodType>>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<Arc<MethodType>> {
        self.methods.get(name).cloned()
    }

    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Invoke `method` with a decoded argument, writing into `replyv`.
    ///
    /// The `Err` string is what goes into `Header.error`.
    pub fn call(&self, method: &MethodType, argv: Slot, replyv: &mut Slot) -> std::result::Result<(), String> {
        method.num_calls.fetch_add(1, Ordering::Relaxed);
        (method.invoke)(self.instance.as_ref(), argv, replyv.as_mut())
    }
}

/// Collects the methods of one service instance.
pub struct ServiceBuilder<S> {
    name: String,
    instance: Arc<S>,
    methods: HashMap<String, Arc<MethodType>>,
    error: Option<RpcError>,
}

impl<S: Send + Sync + 'static> ServiceBuilder<S> {
    /// Builder named after the instance's type.
    pub fn new(instance: S) -> Self {
        Self::named(type_short_name::<S>(), instance)
    }

    pub fn named(name: impl Into<String>, instance: S) -> Self {
        Self {
            name: name.into(),
            instance: Arc::new(instance),
            methods: HashMap::new(),
            error: None,
        }
    }

    /// Register `name` as `fn(&S, A, &mut R) -> Result<(), E>`.
    ///
    /// `A` is decoded from the request body; `R` starts as `R::default()` and
    /// is sent back when the method returns `Ok`.
    pub fn method<A, R, E, F>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + Send + 'static,
        E: Display,
        F: Fn(&S, A, &mut R) -> std::result::Result<(), E> + Send + Sync + 'static,
    {
        if self.error.is_some() {
            return self;
        }
        if !is_method_name(name) {
            self.error = Some(RpcError::Config(format!(
                "{}: invalid method name {name:?}",
                self.name
            )));
            return self;
        }
        if self.methods.contains_key(name) {
            self.error = Some(RpcError::Config(format!(
                "{}: method {name} registered twice",
                self.name
            )));
            return self;
        }

        let invoke: Invoke = Box::new(move |svc, argv, replyv| {
            let svc = svc
                .downcast_ref::<S>()
                .ok_or_else(|| format!("service is not {}", type_name::<S>()))?;
            let argv = argv
                .downcast::<A>()
                .map_err(|_| format!("argument is not {}", type_name::<A>()))?;
            let replyv = replyv
                .downcast_mut::<R>()
                .ok_or_else(|| format!("reply is not {}", type_name::<R>()))?;
            f(svc, *argv, replyv).map_err(|e| e.to_string())
        });

        self.methods.insert(
            name.to_string(),
            Arc::new(MethodType {
                name: name.to_string(),
                arg_type: type_name::<A>(),
                reply_type: type_name::<R>(),
                decode_argv: decode_argv::<A>,
                new_replyv: new_replyv::<R>,
                encode_replyv: encode_replyv::<R>,
                invoke,
                num_calls: AtomicU64::new(0),
            }),
        );
        self
    }

    /// Validate the name and produce the service.
    pub fn build(self) -> Result<Service> {
        if let Some(e) = self.error {
            return Err(e);
        }
        if !is_exported_name(&self.name) {
            return Err(RpcError::InvalidServiceName(self.name));
        }
        for m in self.methods.values() {
            tracing::info!(
                service = %self.name,
                method = %m.name,
                arg = m.arg_type,
                reply = m.reply_type,
                "registered method"
            );
        }
        let instance: Arc<dyn Any + Send + Sync> = self.instance;
        Ok(Service {
            name: self.name,
            instance,
            methods: self.methods,
        })
    }
}

/// Last path segment of a type name, generics stripped.
pub fn type_short_name<T: ?Sized>() -> String {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Public type names: leading uppercase letter, then alphanumerics or `_`.
pub fn is_exported_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

fn is_method_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('.') && !name.chars().any(char::is_whitespace)
}
