//! Name-driven API surface over a [`Client`] or [`Server`].
//!
//! A surface is a tree of lazily created members. At the root the first name
//! accessed becomes a domain (`Game` maps to the prefix `Game.`); inside a
//! domain a name resolves by convention:
//!
//! | name              | client                         | server                    |
//! |-------------------|--------------------------------|---------------------------|
//! | `onLevelUp`       | subscribe to `Game.levelUp`    | subscribe to `Game.levelUp` |
//! | `emitDying`       | notify `Game.dying`            | broadcast `Game.dying`    |
//! | `expose`          | call `Game.expose`             | register a [`Module`]     |
//! | anything else     | call `Game.<name>`             | not present               |
//!
//! `on` needs more than three characters and `emit` more than five; only the
//! first character of the tail is lower-cased. Resolved members are cached so
//! repeated access yields the same `Arc`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::client::{Client, ResponseFuture};
use crate::error::{CallError, EngineError};
use crate::events::{lock, SubscriptionId};
use crate::server::{Method, Server};

#[derive(Clone)]
enum Engine {
    Client(Client),
    Server(Server),
}

pub struct ApiSurface {
    engine: Engine,
    prefix: Option<String>,
    children: Mutex<HashMap<String, Arc<Member>>>,
}

/// What a name resolved to.
pub enum Member {
    Domain(Arc<ApiSurface>),
    Subscribe(Subscribe),
    Emit(Emit),
    Call(Call),
    Expose(Expose),
}

impl ApiSurface {
    pub(crate) fn for_client(client: Client, prefix: Option<String>) -> Arc<Self> {
        Self::build(Engine::Client(client), prefix)
    }

    pub(crate) fn for_server(server: Server, prefix: Option<String>) -> Arc<Self> {
        Self::build(Engine::Server(server), prefix)
    }

    fn build(engine: Engine, prefix: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            prefix,
            children: Mutex::new(HashMap::new()),
        })
    }

    /// `None` for a root surface, otherwise the text prepended to member names.
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Resolve `name` on this surface. Returns `None` only for names a server
    /// surface does not provide; those are not cached.
    pub fn get(&self, name: &str) -> Option<Arc<Member>> {
        let mut children = lock(&self.children);
        if let Some(member) = children.get(name) {
            return Some(member.clone());
        }
        let member = Arc::new(self.resolve_name(name)?);
        children.insert(name.to_string(), member.clone());
        Some(member)
    }

    /// Walk `segments` from this surface, descending through domains.
    pub fn resolve(&self, segments: &[&str]) -> Option<Arc<Member>> {
        let (first, rest) = segments.split_first()?;
        let mut member = self.get(first)?;
        for segment in rest {
            let next = member.as_domain()?.get(segment)?;
            member = next;
        }
        Some(member)
    }

    /// [`ApiSurface::resolve`] over a dotted path such as `"Game.onLevelUp"`.
    pub fn path(&self, path: &str) -> Option<Arc<Member>> {
        let segments: Vec<&str> = path.split('.').collect();
        self.resolve(&segments)
    }

    fn resolve_name(&self, name: &str) -> Option<Member> {
        let Some(prefix) = &self.prefix else {
            return Some(Member::Domain(Self::build(
                self.engine.clone(),
                Some(format!("{}.", name)),
            )));
        };

        let length = name.chars().count();
        if let Some(tail) = name.strip_prefix("on").filter(|_| length > 3) {
            return Some(Member::Subscribe(Subscribe {
                engine: self.engine.clone(),
                event: format!("{}{}", prefix, lower_first(tail)),
            }));
        }
        if let Some(tail) = name.strip_prefix("emit").filter(|_| length > 5) {
            return Some(Member::Emit(Emit {
                engine: self.engine.clone(),
                method: format!("{}{}", prefix, lower_first(tail)),
            }));
        }

        match &self.engine {
            Engine::Server(server) if name == "expose" => Some(Member::Expose(Expose {
                server: server.clone(),
                prefix: prefix.clone(),
            })),
            Engine::Server(_) => None,
            Engine::Client(client) => Some(Member::Call(Call {
                client: client.clone(),
                method: format!("{}{}", prefix, name),
            })),
        }
    }
}

fn lower_first(tail: &str) -> String {
    let mut chars = tail.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl Member {
    pub fn as_domain(&self) -> Option<&Arc<ApiSurface>> {
        match self {
            Member::Domain(surface) => Some(surface),
            _ => None,
        }
    }

    pub fn as_subscribe(&self) -> Option<&Subscribe> {
        match self {
            Member::Subscribe(op) => Some(op),
            _ => None,
        }
    }

    pub fn as_emit(&self) -> Option<&Emit> {
        match self {
            Member::Emit(op) => Some(op),
            _ => None,
        }
    }

    pub fn as_call(&self) -> Option<&Call> {
        match self {
            Member::Call(op) => Some(op),
            _ => None,
        }
    }

    pub fn as_expose(&self) -> Option<&Expose> {
        match self {
            Member::Expose(op) => Some(op),
            _ => None,
        }
    }
}

/// `on<Event>`: subscribe to a notification.
pub struct Subscribe {
    engine: Engine,
    event: String,
}

impl Subscribe {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn call(&self, handler: impl Fn(Option<Value>) + Send + Sync + 'static) -> SubscriptionId {
        match &self.engine {
            Engine::Client(client) => client.on(&self.event, handler),
            Engine::Server(server) => server.on(&self.event, handler),
        }
    }
}

/// `emit<Event>`: send a notification. On a server this is a broadcast and
/// can fail with [`EngineError::CapabilityMissing`].
pub struct Emit {
    engine: Engine,
    method: String,
}

impl Emit {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn call(&self, params: Option<Value>) -> Result<(), EngineError> {
        match &self.engine {
            Engine::Client(client) => {
                client.notify(self.method.as_str(), params);
                Ok(())
            }
            Engine::Server(server) => server.notify(self.method.as_str(), params),
        }
    }
}

/// Any other name on a client: a request.
pub struct Call {
    client: Client,
    method: String,
}

impl Call {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn call(&self, params: Option<Value>) -> ResponseFuture {
        self.client.call(self.method.as_str(), params)
    }

    pub fn call_as<R: DeserializeOwned>(
        &self,
        params: impl Serialize,
    ) -> impl Future<Output = Result<R, CallError>> {
        self.client.call_as(self.method.clone(), params)
    }
}

/// `expose` on a server: register every method of a [`Module`] under the
/// surface's prefix.
pub struct Expose {
    server: Server,
    prefix: String,
}

impl Expose {
    pub fn call(&self, module: Option<Module>) -> Result<(), EngineError> {
        let module = module.ok_or(EngineError::InvalidArgument("module"))?;
        for (name, method) in module.methods {
            self.server
                .register(format!("{}{}", self.prefix, name), method);
        }
        Ok(())
    }
}

/// A named set of handlers exposed together.
#[derive(Clone, Default)]
pub struct Module {
    methods: Vec<(String, Method)>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Option<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.methods.push((name.into(), Method::sync(handler)));
        self
    }

    pub fn method_async<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.methods.push((name.into(), Method::deferred(handler)));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.methods.iter().map(|(name, _)| name.as_str()).collect()
    }
}
