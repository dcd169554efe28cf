//! Remote values.
//!
//! A [`Remote`] is a value that is only known after some other resource has
//! been realized on the platform. Local resource definitions hold `Remote`
//! fields for the ARNs and names they need from their dependencies, and the
//! dependency edge travels with the value through `HasDependencies`.
use std::sync::{Arc, Mutex};

use crate::{Dependencies, Error, HasDependencies};

/// A shared slot holding the realized output of one resource.
///
/// Filled by the stack when the resource is created or loaded. Cloning an
/// `OutputVar` clones the handle, not the slot.
pub struct OutputVar<T> {
    name: String,
    value: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for OutputVar<T> {
    fn clone(&self) -> Self {
        OutputVar {
            name: self.name.clone(),
            value: self.value.clone(),
        }
    }
}

impl<T> core::fmt::Debug for OutputVar<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputVar")
            .field("name", &self.name)
            .field(
                "value",
                if self.value.lock().unwrap().is_some() {
                    &"resolved"
                } else {
                    &"unresolved"
                },
            )
            .finish()
    }
}

impl<T> OutputVar<T> {
    pub fn new(name: impl Into<String>) -> Self {
        OutputVar {
            name: name.into(),
            value: Arc::new(Mutex::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&self, value: Option<T>) {
        *self.value.lock().unwrap() = value;
    }

    pub fn get(&self) -> Option<T>
    where
        T: Clone,
    {
        self.value.lock().unwrap().clone()
    }
}

enum RemoteInner<X> {
    /// A literal, or a deserialized last-known value.
    Value {
        depends_on: Option<String>,
        value: Option<X>,
    },
    /// A mapping over some resource's output slot.
    Deferred {
        depends_on: String,
        resolve: Arc<dyn Fn() -> Option<X>>,
    },
}

impl<X: Clone> Clone for RemoteInner<X> {
    fn clone(&self) -> Self {
        match self {
            RemoteInner::Value { depends_on, value } => RemoteInner::Value {
                depends_on: depends_on.clone(),
                value: value.clone(),
            },
            RemoteInner::Deferred {
                depends_on,
                resolve,
            } => RemoteInner::Deferred {
                depends_on: depends_on.clone(),
                resolve: resolve.clone(),
            },
        }
    }
}

/// A value that may be deferred until a dependency is realized.
///
/// Literals convert with `From`, so `"hi".into()` is a resolved
/// `Remote<String>` with no dependency edge. Deferred values come from
/// [`DeclaredResource::output`](crate::DeclaredResource::output) and carry an
/// edge on the declaring resource.
///
/// Serializing a `Remote` records the dependency name and the last known
/// value; deserializing restores both, with the value treated as possibly
/// stale.
pub struct Remote<X> {
    inner: RemoteInner<X>,
}

impl<X: Clone> Clone for Remote<X> {
    fn clone(&self) -> Self {
        Remote {
            inner: self.inner.clone(),
        }
    }
}

impl<X: Clone + core::fmt::Debug> core::fmt::Debug for Remote<X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("depends_on", &self.depends_on())
            .field("value", &self.try_get())
            .finish()
    }
}

impl<X: Clone + PartialEq> PartialEq for Remote<X> {
    fn eq(&self, other: &Self) -> bool {
        self.depends_on() == other.depends_on() && self.try_get() == other.try_get()
    }
}

impl<X> From<X> for Remote<X> {
    fn from(value: X) -> Self {
        Remote {
            inner: RemoteInner::Value {
                depends_on: None,
                value: Some(value),
            },
        }
    }
}

impl From<&str> for Remote<String> {
    fn from(value: &str) -> Self {
        Remote::from(value.to_owned())
    }
}

/// Serialization proxy. The deferred closure cannot travel, so what is
/// written is the edge plus the value as it was at serialization time.
#[derive(serde::Serialize, serde::Deserialize)]
struct RemoteProxy<X> {
    depends_on: Option<String>,
    last_known_value: Option<X>,
}

impl<X: Clone + serde::Serialize> serde::Serialize for Remote<X> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        RemoteProxy {
            depends_on: self.depends_on(),
            last_known_value: self.try_get(),
        }
        .serialize(serializer)
    }
}

impl<'de, X: serde::Deserialize<'de>> serde::Deserialize<'de> for Remote<X> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let proxy = RemoteProxy::deserialize(deserializer)?;
        Ok(Remote {
            inner: RemoteInner::Value {
                depends_on: proxy.depends_on,
                value: proxy.last_known_value,
            },
        })
    }
}

impl<X> HasDependencies for Remote<X> {
    fn dependencies(&self) -> Dependencies {
        match self.depends_on() {
            Some(name) => Dependencies::on(name),
            None => Dependencies::default(),
        }
    }
}

impl<X> Remote<X> {
    pub(crate) fn mapped<R>(
        depends_on: &str,
        var: OutputVar<R>,
        f: impl Fn(&R) -> X + 'static,
    ) -> Self
    where
        R: Clone + 'static,
        X: 'static,
    {
        Remote {
            inner: RemoteInner::Deferred {
                depends_on: depends_on.to_owned(),
                resolve: Arc::new(move || var.get().map(|r| f(&r))),
            },
        }
    }

    /// The name of the resource this value waits on, if any.
    pub fn depends_on(&self) -> Option<String> {
        match &self.inner {
            RemoteInner::Value { depends_on, .. } => depends_on.clone(),
            RemoteInner::Deferred { depends_on, .. } => Some(depends_on.clone()),
        }
    }

    /// The value, if it has resolved.
    pub fn try_get(&self) -> Option<X>
    where
        X: Clone,
    {
        match &self.inner {
            RemoteInner::Value { value, .. } => value.clone(),
            RemoteInner::Deferred { resolve, .. } => resolve(),
        }
    }

    /// The value, or [`Error::RemoteUnresolved`] naming the dependency when
    /// it has not resolved yet.
    pub fn get(&self) -> Result<X, Error>
    where
        X: Clone,
    {
        self.try_get().ok_or_else(|| Error::RemoteUnresolved {
            ty: std::any::type_name::<X>(),
            depends_on: self
                .depends_on()
                .unwrap_or_else(|| "nothing (literal without a value)".to_owned()),
        })
    }

    /// Map the eventual value, keeping the dependency edge.
    pub fn map<Y>(self, f: impl Fn(&X) -> Y + 'static) -> Remote<Y>
    where
        X: 'static,
    {
        let inner = match self.inner {
            RemoteInner::Value { depends_on, value } => RemoteInner::Value {
                depends_on,
                value: value.map(|x| f(&x)),
            },
            RemoteInner::Deferred {
                depends_on,
                resolve,
            } => RemoteInner::Deferred {
                depends_on,
                resolve: Arc::new(move || resolve().map(|x| f(&x))),
            },
        };
        Remote { inner }
    }
}
