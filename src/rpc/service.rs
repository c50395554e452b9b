//! Service registration.
//!
//! A [`ServiceDescriptor`] wires a plain Rust type into the call layer one
//! member at a time: methods, notifications, property accessors, and event
//! sources. Building the descriptor erases the service type, leaving a
//! [`RegisteredService`] of boxed async invokers keyed by `(kind, name)`
//! that the dispatch path can drive without generics.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, OnceLock};

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{CreationPolicy, RpcKind, RpcSignature};
use crate::config::ResponseConfig;
use crate::error::{CrosstalkError, Result};
use crate::session::Session;

/// Default event channel capacity; slow subscribers past this lag and lose
/// events.
const EVENT_CAPACITY: usize = 64;

type ServiceInstance = Arc<dyn Any + Send + Sync>;
type Invoker = Arc<dyn Fn(ServiceInstance, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
type EventSource = Arc<dyn Fn(ServiceInstance) -> Result<broadcast::Receiver<Value>> + Send + Sync>;

#[derive(Default)]
struct Member {
    /// Methods and property getters.
    invoker: Option<Invoker>,
    /// Property setters.
    setter: Option<Invoker>,
    /// Notification targets (result discarded).
    notifier: Option<Invoker>,
    /// Event stream sources.
    event: Option<EventSource>,
}

/// Broadcast source for one service event. Embed one per event in the
/// service type and wire it with [`ServiceDescriptor::event`].
pub struct EventEmitter<T> {
    tx: broadcast::Sender<Value>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> EventEmitter<T> {
    /// Emitter with the default buffer.
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CAPACITY)
    }

    /// Emitter with an explicit buffer size.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            _marker: PhantomData,
        }
    }

    /// Publish one event to every live subscriber. Succeeds with zero
    /// subscribers; the event is simply dropped.
    pub fn emit(&self, event: &T) -> Result<()> {
        let payload = serde_json::to_value(event)?;
        let _ = self.tx.send(payload);
        Ok(())
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Raw subscription used by the forwarding machinery.
    pub fn subscribe_raw(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }
}

impl<T: Serialize> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for EventEmitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

/// Typed builder for one service.
pub struct ServiceDescriptor<S> {
    name: String,
    policy: CreationPolicy,
    factory: Arc<dyn Fn() -> Arc<S> + Send + Sync>,
    members: HashMap<(RpcKind, String), Member>,
}

impl<S: Send + Sync + 'static> ServiceDescriptor<S> {
    /// Describe a service created by `factory`.
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            policy: CreationPolicy::default(),
            factory: Arc::new(move || Arc::new(factory())),
            members: HashMap::new(),
        }
    }

    /// Set the instantiation policy.
    pub fn with_policy(mut self, policy: CreationPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn member(&mut self, kind: RpcKind, name: &str) -> &mut Member {
        self.members.entry((kind, name.to_string())).or_default()
    }

    fn downcast(instance: ServiceInstance) -> Result<Arc<S>> {
        instance.downcast::<S>().map_err(|_| {
            CrosstalkError::InvalidState("service instance type mismatch".to_string())
        })
    }

    /// Wire a request/response method.
    pub fn method<Arg, Ret, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        Arg: DeserializeOwned + Send + 'static,
        Ret: Serialize + Send + 'static,
        F: Fn(Arc<S>, Arg) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Ret>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.member(RpcKind::Method, name).invoker = Some(Arc::new(move |instance, payload| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let service = Self::downcast(instance)?;
                let arg: Arg = serde_json::from_value(payload)?;
                let ret = handler(service, arg).await?;
                Ok(serde_json::to_value(ret)?)
            })
        }));
        self
    }

    /// Wire a one-way notification target.
    pub fn notification<Arg, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        Arg: DeserializeOwned + Send + 'static,
        F: Fn(Arc<S>, Arg) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.member(RpcKind::Method, name).notifier = Some(Arc::new(move |instance, payload| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let service = Self::downcast(instance)?;
                let arg: Arg = serde_json::from_value(payload)?;
                handler(service, arg).await?;
                Ok(Value::Null)
            })
        }));
        self
    }

    /// Wire a property getter.
    pub fn property_get<Ret, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        Ret: Serialize + Send + 'static,
        F: Fn(Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Ret>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.member(RpcKind::Property, name).invoker = Some(Arc::new(move |instance, _payload| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let service = Self::downcast(instance)?;
                let value = handler(service).await?;
                Ok(serde_json::to_value(value)?)
            })
        }));
        self
    }

    /// Wire a property setter.
    pub fn property_set<Arg, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        Arg: DeserializeOwned + Send + 'static,
        F: Fn(Arc<S>, Arg) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.member(RpcKind::Property, name).setter = Some(Arc::new(move |instance, payload| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let service = Self::downcast(instance)?;
                let arg: Arg = serde_json::from_value(payload)?;
                handler(service, arg).await?;
                Ok(Value::Null)
            })
        }));
        self
    }

    /// Wire a subscribable event, usually backed by an [`EventEmitter`]
    /// field on the service.
    pub fn event<F>(mut self, name: &str, source: F) -> Self
    where
        F: Fn(&S) -> broadcast::Receiver<Value> + Send + Sync + 'static,
    {
        self.member(RpcKind::Event, name).event = Some(Arc::new(move |instance| {
            let service = Self::downcast(instance)?;
            Ok(source(&service))
        }));
        self
    }

    /// Erase the service type for registration.
    pub(crate) fn build(self) -> RegisteredService {
        let factory = self.factory;
        RegisteredService {
            name: self.name,
            policy: self.policy,
            factory: Arc::new(move || factory() as ServiceInstance),
            singleton: OnceLock::new(),
            members: self.members,
            event_tasks: Mutex::new(Vec::new()),
        }
    }
}

impl<S> std::fmt::Debug for ServiceDescriptor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("members", &self.members.len())
            .finish()
    }
}

/// A type-erased, registered service.
pub struct RegisteredService {
    name: String,
    policy: CreationPolicy,
    factory: Arc<dyn Fn() -> ServiceInstance + Send + Sync>,
    singleton: OnceLock<ServiceInstance>,
    members: HashMap<(RpcKind, String), Member>,
    /// Live event-forwarding tasks, keyed by the subscription token.
    event_tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl RegisteredService {
    /// Registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn instance(&self) -> ServiceInstance {
        match self.policy {
            CreationPolicy::Singleton => {
                Arc::clone(self.singleton.get_or_init(|| (self.factory)()))
            }
            CreationPolicy::Transient => (self.factory)(),
        }
    }

    fn member(&self, kind: RpcKind, name: &str) -> Option<&Member> {
        self.members.get(&(kind, name.to_string()))
    }

    fn member_not_found(&self, signature: &RpcSignature) -> CrosstalkError {
        CrosstalkError::MemberNotFound(format!("{}.{}", self.name, signature.member))
    }

    /// Invoke a request-shaped member: a method, or a property access where
    /// a null payload reads and anything else writes.
    pub(crate) async fn invoke(&self, signature: &RpcSignature, payload: Value) -> Result<Value> {
        let member = self
            .member(signature.kind, &signature.member)
            .ok_or_else(|| self.member_not_found(signature))?;
        let invoker = match signature.kind {
            RpcKind::Method => member.invoker.as_ref(),
            RpcKind::Property => {
                if payload.is_null() {
                    member.invoker.as_ref()
                } else {
                    member.setter.as_ref()
                }
            }
            RpcKind::Event => None,
        }
        .ok_or_else(|| self.member_not_found(signature))?;
        invoker(self.instance(), payload).await
    }

    /// Invoke a notification target, falling back to the method invoker
    /// with its result discarded.
    pub(crate) async fn notify(&self, signature: &RpcSignature, payload: Value) -> Result<()> {
        let member = self
            .member(signature.kind, &signature.member)
            .ok_or_else(|| self.member_not_found(signature))?;
        let invoker = member
            .notifier
            .as_ref()
            .or(member.invoker.as_ref())
            .ok_or_else(|| self.member_not_found(signature))?;
        invoker(self.instance(), payload).await?;
        Ok(())
    }

    fn event_source(&self, signature: &RpcSignature) -> Result<broadcast::Receiver<Value>> {
        let source = self
            .member(RpcKind::Event, &signature.member)
            .and_then(|member| member.event.as_ref())
            .ok_or_else(|| self.member_not_found(signature))?;
        source(self.instance())
    }

    pub(crate) fn push_event_task(&self, token: String, handle: JoinHandle<()>) {
        self.event_tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((token, handle));
    }

    /// Detach all event-forwarding tasks, leaving their abort/notify policy
    /// to the caller.
    pub(crate) fn take_event_tasks(&self) -> Vec<(String, JoinHandle<()>)> {
        std::mem::take(
            &mut *self
                .event_tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }
}

impl std::fmt::Debug for RegisteredService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredService")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("members", &self.members.len())
            .finish()
    }
}

/// Attach a subscription: forward every event on the source to the
/// subscriber as a non-terminal response, and close the stream with a
/// terminal frame when the source goes away.
pub(crate) fn spawn_event_forwarder(
    session: &Session,
    service: &Arc<RegisteredService>,
    signature: &RpcSignature,
    token: String,
) {
    let mut source = match service.event_source(signature) {
        Ok(source) => source,
        Err(err) => {
            let _ = session.send_error_response(&token, err.to_string(), ResponseConfig::default());
            return;
        }
    };
    let session = session.clone();
    let forward_token = token.clone();
    let handle = tokio::spawn(async move {
        loop {
            match source.recv().await {
                Ok(value) => {
                    if session
                        .send_response_value(&forward_token, value, false, ResponseConfig::default())
                        .is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(token = %forward_token, missed, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let _ = session.send_response_value(
                        &forward_token,
                        Value::Null,
                        true,
                        ResponseConfig::default(),
                    );
                    break;
                }
            }
        }
    });
    service.push_event_task(token, handle);
}
