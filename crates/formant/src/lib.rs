//! # Formant
//!
//! Formant is a small library for declaring cloud infrastructure as Rust
//! values and realizing those declarations against a platform API.
//!
//! Declarations are collected into a [`Stack`], which builds a Directed
//! Acyclic Graph (DAG) of the resources and their dependency edges. The graph
//! is scheduled with `dagga` into batches that respect every declared edge,
//! and can be inspected as a [`Plan`] before a single remote call is made.
//!
//! ## Concepts
//!
//! - **Resource**: a piece of platform infrastructure described by a local
//!   Rust value. The [`Resource`] trait says how to create and delete it.
//! - **Remote value**: an output of a resource that is only known after the
//!   resource has been realized (an ARN, a generated name). See
//!   [`remote::Remote`]. Using a remote value of resource `a` in the
//!   definition of resource `b` gives `b` an implicit dependency edge on `a`.
//! - **Explicit edges**: some orderings exist without any value flowing
//!   between the resources. [`Stack::add_dependency`] declares those.
//! - **Components**: a [`Component`] is an ownership node. Resources declared
//!   with [`Stack::resource_in`] carry a parent edge to the component, are
//!   grouped with it, and are destroyed before it. Dropping a component's
//!   declarations from the program orphans the whole bundle, and the next
//!   plan schedules it for destruction, children first.
//!
//! Realized resources are recorded in a JSON state file. On the next run a
//! declaration whose name is present in the state is loaded instead of
//! created. Formant has no update support: to change a realized resource,
//! destroy it and declare the new definition.
//!
//! ## Errors
//!
//! Everything that can fail returns [`Error`]. Configuration mistakes (empty
//! or duplicate names, references to undeclared resources) fail before any
//! remote call is issued; platform errors are surfaced verbatim from the
//! [`Resource`] implementation that raised them.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    ops::Deref,
    path::{Path, PathBuf},
    pin::Pin,
    sync::{Arc, Mutex},
};

use dagga::{Node, Schedule};
use snafu::prelude::*;
use tokio::io::AsyncWriteExt;

pub use formant_derive::HasDependencies;

pub mod aws;
mod has_dependencies_impl;
pub mod remote;
#[cfg(test)]
mod test;

use remote::{OutputVar, Remote};

/// Marker trait for userland errors.
pub trait UserError: core::fmt::Display + core::fmt::Debug + Send + Sync + 'static {}
impl<T: core::fmt::Display + core::fmt::Debug + Send + Sync + 'static> UserError for T {}

/// Top-level error enum that encompasses all errors.
#[derive(snafu::Snafu, Debug)]
pub enum Error {
    #[snafu(display("Resource names must not be empty"))]
    EmptyName,

    #[snafu(display("Resource '{name}' is declared more than once"))]
    DuplicateName { name: String },

    #[snafu(display("Could not find a resource by the name '{name}'"))]
    MissingResource { name: String },

    #[snafu(display("Remote value of {ty:?} is unresolved. Depends on {depends_on}"))]
    RemoteUnresolved {
        ty: &'static str,
        depends_on: String,
    },

    #[snafu(display("Could not build schedule: {msg}"))]
    Schedule { msg: String },

    #[snafu(display("Could not read state file '{path:?}': {source}"))]
    StateRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not write state file '{path:?}': {source}"))]
    StateWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not serialize '{name}': {source}"))]
    Serialize {
        name: String,
        source: serde_json::Error,
    },

    #[snafu(display("Could not deserialize '{name}': {source}"))]
    Deserialize {
        name: String,
        source: serde_json::Error,
    },

    #[snafu(display("Error during '{name}' creation: {error}"))]
    Create {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' destruction: {error}"))]
    Destroy {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Exported output '{name}' did not resolve: {msg}"))]
    Output { name: String, msg: String },
}

type Result<T, E = Error> = core::result::Result<T, E>;

/// IaC resources.
///
/// Represents a resource created on a platform (ie AWS, Digital Ocean, etc).
pub trait Resource:
    core::fmt::Debug
    + Clone
    + PartialEq
    + HasDependencies
    + serde::Serialize
    + serde::de::DeserializeOwned
    + 'static
{
    /// Type of the platform/resource provider.
    ///
    /// For example `aws_config::SdkConfig` in the case of amazon web services.
    type Provider;

    /// Errors that may occur interacting with the provider.
    type Error: UserError;

    /// The remote type of this resource, which can be used to fill in
    /// [`Remote`] values in other resources.
    type Output: core::fmt::Debug
        + Clone
        + serde::Serialize
        + serde::de::DeserializeOwned
        + 'static;

    /// Creates a new resource on the platform.
    ///
    /// ## Note
    /// This method is explicitly `unimplemented!` for developer convenience,
    /// so read-only or bookkeeping resources only define what they need.
    /// Calling an unimplemented method panics.
    fn create(
        &self,
        _provider: &Self::Provider,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> {
        async {
            unimplemented!(
                "Resource::create is unimplemented for {}",
                std::any::type_name::<Self>()
            )
        }
    }

    /// Deletes a resource from the platform, given its previously recorded
    /// remote state.
    ///
    /// ## Note
    /// This method is explicitly `unimplemented!` for developer convenience.
    /// Calling an unimplemented method panics.
    fn delete(
        &self,
        _provider: &Self::Provider,
        _previous_remote: &Self::Output,
    ) -> impl Future<Output = Result<(), Self::Error>> {
        async {
            unimplemented!(
                "Resource::delete is unimplemented for {}",
                std::any::type_name::<Self>()
            )
        }
    }
}

#[derive(Clone, Default, Debug)]
pub struct Dependencies {
    /// Names of resources this value depends on.
    inner: Vec<String>,
}

impl IntoIterator for Dependencies {
    type Item = String;

    type IntoIter = <Vec<String> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl core::fmt::Display for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.inner.join(", "))
    }
}

impl Dependencies {
    pub fn merge(self, other: Self) -> Self {
        Dependencies {
            inner: [self.inner, other.inner].concat(),
        }
    }

    pub(crate) fn on(name: String) -> Self {
        Dependencies { inner: vec![name] }
    }
}

/// Tracks dependencies between resources.
///
/// This trait can be derived, and has a default implementation that
/// reports zero dependencies.
pub trait HasDependencies {
    fn dependencies(&self) -> Dependencies {
        Dependencies::default()
    }
}

/// What a plan will do with one declaration.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Action {
    /// The resource exists in the deployment state and is reused as-is.
    Load,
    /// The resource will be created on the platform.
    Create,
    /// The resource will be deleted from the platform.
    Destroy,
}

impl core::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Action::Load => "load",
            Action::Create => "create",
            Action::Destroy => "destroy",
        })
    }
}

/// One realized (or about to be realized) resource in the state file.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct StateEntry {
    /// The Rust type name of the resource (via `std::any::type_name::<T>()`).
    /// Used to find the right deleter for orphans and teardowns.
    type_name: String,
    /// Local definition as it was realized.
    local: serde_json::Value,
    /// Remote output recorded at creation time.
    remote: serde_json::Value,
    /// The owning component, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<String>,
    /// The resource names this resource depends on, implicit and explicit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<String>,
}

/// The whole deployment: every realized resource plus the exported outputs.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
struct DeploymentState {
    resources: BTreeMap<String, StateEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    outputs: BTreeMap<String, String>,
}

type SharedState = Arc<Mutex<DeploymentState>>;

const COMPONENT_TYPE_NAME: &str = "formant::Component";

async fn save_state(state: &DeploymentState, path: &Path) -> Result<()> {
    let contents = serde_json::to_string_pretty(state).context(SerializeSnafu {
        name: "deployment state",
    })?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context(StateWriteSnafu { path: parent })?;
    }
    let mut file = tokio::fs::File::create(path)
        .await
        .context(StateWriteSnafu { path })?;
    file.write_all(contents.as_bytes())
        .await
        .context(StateWriteSnafu { path })?;
    // write_all only buffers; the state must be on disk before the next
    // action runs or the process exits.
    file.flush().await.context(StateWriteSnafu { path })?;
    file.sync_all().await.context(StateWriteSnafu { path })?;
    Ok(())
}

type RunFn<P> = Box<dyn FnOnce(&'_ P) -> Pin<Box<dyn Future<Output = Result<()>> + '_>>>;

/// A run function that only removes the entry from the state file.
///
/// Used for components (which have no remote counterpart) when they are
/// orphaned or torn down.
fn remove_entry_run<P>(id: String, state: SharedState, path: PathBuf) -> RunFn<P> {
    Box::new(move |_provider: &P| {
        Box::pin(async move {
            log::info!("destroy '{id}' (bookkeeping only)");
            let snapshot = {
                let mut guard = state.lock().unwrap();
                guard.resources.remove(&id);
                guard.clone()
            };
            save_state(&snapshot, &path).await
        }) as Pin<Box<dyn Future<Output = Result<()>> + '_>>
    })
}

/// A declaration collected by [`Stack`] but not yet planned.
struct Declaration<P> {
    id: String,
    action: Action,
    type_name: &'static str,
    parent: Option<String>,
    /// Shared so explicit edges added after declaration are seen by the
    /// run closure when it records `depends_on` into the state.
    reads: Arc<Mutex<Vec<String>>>,
    run: RunFn<P>,
}

/// A type-erased delete function for a specific resource type.
///
/// Registered automatically the first time a resource type is declared, so
/// that orphaned state entries of that type can be destroyed.
struct Deleter<P> {
    make_run: Box<dyn Fn(String, StateEntry) -> RunFn<P>>,
}

/// The payload carried by every node in the scheduled DAG.
struct StackNode<P> {
    id: String,
    action: Action,
    type_name: String,
    is_orphan: bool,
    run: RunFn<P>,
}

/// A single planned action for a resource.
#[derive(Clone, Debug)]
pub struct PlannedAction {
    /// The resource name.
    pub id: String,
    /// The action to be taken.
    pub action: Action,
    /// The Rust type name of the resource.
    pub type_name: String,
    /// The 1-based schedule step this action runs in. Actions in the same
    /// step have no ordering between them.
    pub step: usize,
    /// Whether this is a state entry with no live declaration.
    pub is_orphan: bool,
}

/// A plan of actions produced by [`Stack::plan`] or [`Stack::teardown`].
///
/// Inspect the plan before passing it to [`Stack::apply`] to execute.
pub struct Plan<P> {
    /// The planned actions, in schedule order.
    pub actions: Vec<PlannedAction>,
    /// State entries that could not be scheduled (unregistered types).
    pub warnings: Vec<String>,
    teardown: bool,
    schedule: Schedule<Node<StackNode<P>, usize>>,
}

impl<P> Plan<P> {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl<P> core::fmt::Display for Plan<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.actions.is_empty() {
            f.write_str("No changes.\n")?;
        }
        let mut step = 0;
        for action in &self.actions {
            if action.step != step {
                step = action.step;
                writeln!(f, "--- step {step}")?;
            }
            let orphan_marker = if action.is_orphan { " (orphan)" } else { "" };
            writeln!(
                f,
                "  {} '{}' [{}]{}",
                action.action, action.id, action.type_name, orphan_marker
            )?;
        }
        if step != 0 {
            f.write_str("---\n")?;
        }
        for warning in &self.warnings {
            writeln!(f, "  WARNING: {warning}")?;
        }
        Ok(())
    }
}

/// An ownership node grouping the resources declared inside it.
///
/// Obtained from [`Stack::component`] and passed to [`Stack::resource_in`].
#[derive(Clone, Debug)]
pub struct Component {
    name: String,
}

impl Component {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A resource declaration returned by [`Stack::resource`].
///
/// Dereferences to the local definition, and produces [`Remote`] values
/// mapping the resource's realized output via [`DeclaredResource::output`].
#[derive(Clone, Debug)]
pub struct DeclaredResource<L, R> {
    id: String,
    local: L,
    action: Action,
    var: OutputVar<R>,
}

impl<L, R> Deref for DeclaredResource<L, R> {
    type Target = L;

    fn deref(&self) -> &Self::Target {
        &self.local
    }
}

impl<L, R> DeclaredResource<L, R> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Return the action that the plan will apply to this resource.
    pub fn action(&self) -> Action {
        self.action
    }

    /// Map a remote output value for use in other local definitions.
    ///
    /// The returned [`Remote`] resolves once this resource has been realized
    /// (or loaded), and carries a dependency edge on it.
    pub fn output<X>(&self, f: impl Fn(&R) -> X + 'static) -> Remote<X>
    where
        R: Clone + 'static,
        X: Clone + core::fmt::Debug + 'static,
    {
        Remote::mapped(&self.id, self.var.clone(), f)
    }
}

/// Collects declarations, plans them into a schedule, and realizes them
/// against a provider.
pub struct Stack<P> {
    path: PathBuf,
    provider: P,
    state: SharedState,
    declarations: Vec<Declaration<P>>,
    /// Resource name to declaration index; the index doubles as the
    /// dagga resource key.
    index: HashMap<String, usize>,
    children: BTreeMap<String, Vec<String>>,
    exports: Vec<(String, Remote<String>)>,
    deleters: HashMap<String, Deleter<P>>,
}

impl<P: 'static> Stack<P> {
    /// Open a stack whose state lives in `path` (a directory).
    ///
    /// If a state file from a previous apply exists it is loaded, and
    /// matching declarations become [`Action::Load`] instead of
    /// [`Action::Create`].
    pub fn new(path: impl AsRef<Path>, provider: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = path.join("stack.json");
        let state = if file.exists() {
            log::debug!("reading deployment state from {file:?}");
            let contents = std::fs::read_to_string(&file).context(StateReadSnafu {
                path: file.clone(),
            })?;
            serde_json::from_str(&contents).context(DeserializeSnafu {
                name: "deployment state",
            })?
        } else {
            DeploymentState::default()
        };
        Ok(Self {
            path,
            provider,
            state: Arc::new(Mutex::new(state)),
            declarations: vec![],
            index: HashMap::default(),
            children: BTreeMap::default(),
            exports: vec![],
            deleters: HashMap::default(),
        })
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    fn state_file(&self) -> PathBuf {
        self.path.join("stack.json")
    }

    fn ensure_new_name(&self, id: &str) -> Result<()> {
        snafu::ensure!(!id.is_empty(), EmptyNameSnafu);
        snafu::ensure!(
            !self.index.contains_key(id),
            DuplicateNameSnafu { name: id }
        );
        Ok(())
    }

    fn register_deleter<T>(&mut self)
    where
        T: Resource<Provider = P>,
    {
        let type_name = std::any::type_name::<T>();
        if self.deleters.contains_key(type_name) {
            return;
        }
        let state = self.state.clone();
        let path = self.state_file();
        self.deleters.insert(
            type_name.to_owned(),
            Deleter {
                make_run: Box::new(move |id: String, entry: StateEntry| {
                    let state = state.clone();
                    let path = path.clone();
                    Box::new(move |provider: &P| {
                        Box::pin(async move {
                            let local: T =
                                serde_json::from_value(entry.local).context(DeserializeSnafu {
                                    name: id.clone(),
                                })?;
                            let remote: T::Output = serde_json::from_value(entry.remote)
                                .context(DeserializeSnafu {
                                    name: format!("remote {id}"),
                                })?;
                            log::info!("destroy '{id}':");
                            local
                                .delete(provider, &remote)
                                .await
                                .map_err(|error| Error::Destroy {
                                    name: id.clone(),
                                    error: Box::new(error),
                                })?;
                            let snapshot = {
                                let mut guard = state.lock().unwrap();
                                guard.resources.remove(&id);
                                guard.clone()
                            };
                            save_state(&snapshot, &path).await?;
                            log::info!("  '{id}' is destroyed");
                            Ok(())
                        }) as Pin<Box<dyn Future<Output = Result<()>> + '_>>
                    })
                }),
            },
        );
    }

    /// Declare an ownership node.
    ///
    /// The component itself touches no platform API; it exists so that the
    /// resources declared inside it share a parent edge and a lifecycle.
    pub fn component(&mut self, name: impl AsRef<str>) -> Result<Component> {
        let name = name.as_ref();
        self.ensure_new_name(name)?;
        let known = self.state.lock().unwrap().resources.contains_key(name);
        let action = if known { Action::Load } else { Action::Create };
        let run: RunFn<P> = {
            let id = name.to_owned();
            let state = self.state.clone();
            let path = self.state_file();
            Box::new(move |_provider: &P| {
                Box::pin(async move {
                    if action == Action::Create {
                        log::info!("create '{id}' (component)");
                        let snapshot = {
                            let mut guard = state.lock().unwrap();
                            guard.resources.insert(
                                id.clone(),
                                StateEntry {
                                    type_name: COMPONENT_TYPE_NAME.to_owned(),
                                    local: serde_json::Value::Null,
                                    remote: serde_json::Value::Null,
                                    parent: None,
                                    depends_on: vec![],
                                },
                            );
                            guard.clone()
                        };
                        save_state(&snapshot, &path).await?;
                    }
                    Ok(())
                }) as Pin<Box<dyn Future<Output = Result<()>> + '_>>
            })
        };
        self.index.insert(name.to_owned(), self.declarations.len());
        self.children.entry(name.to_owned()).or_default();
        self.declarations.push(Declaration {
            id: name.to_owned(),
            action,
            type_name: COMPONENT_TYPE_NAME,
            parent: None,
            reads: Arc::new(Mutex::new(vec![])),
            run,
        });
        Ok(Component {
            name: name.to_owned(),
        })
    }

    /// Declare a top-level resource.
    pub fn resource<T>(
        &mut self,
        id: impl AsRef<str>,
        local_definition: T,
    ) -> Result<DeclaredResource<T, T::Output>>
    where
        T: Resource<Provider = P>,
    {
        self.declare(None, id.as_ref(), local_definition)
    }

    /// Declare a resource owned by `component`.
    ///
    /// The resource carries a parent edge to the component: it is grouped
    /// with it, and at destruction time it goes before it.
    pub fn resource_in<T>(
        &mut self,
        component: &Component,
        id: impl AsRef<str>,
        local_definition: T,
    ) -> Result<DeclaredResource<T, T::Output>>
    where
        T: Resource<Provider = P>,
    {
        self.declare(Some(component.name.clone()), id.as_ref(), local_definition)
    }

    fn declare<T>(
        &mut self,
        parent: Option<String>,
        id: &str,
        local_definition: T,
    ) -> Result<DeclaredResource<T, T::Output>>
    where
        T: Resource<Provider = P>,
    {
        self.ensure_new_name(id)?;
        self.register_deleter::<T>();

        let var = OutputVar::<T::Output>::new(id);
        let stored = self.state.lock().unwrap().resources.get(id).cloned();
        let action = match stored {
            Some(entry) => {
                let remote: T::Output =
                    serde_json::from_value(entry.remote).context(DeserializeSnafu {
                        name: format!("remote {id}"),
                    })?;
                var.set(Some(remote));
                Action::Load
            }
            None => Action::Create,
        };

        let reads: Arc<Mutex<Vec<String>>> =
            Arc::new(Mutex::new(local_definition.dependencies().into_iter().collect()));

        let run: RunFn<P> = {
            let id = id.to_owned();
            let local = local_definition.clone();
            let var = var.clone();
            let state = self.state.clone();
            let path = self.state_file();
            let parent = parent.clone();
            let reads = reads.clone();
            Box::new(move |provider: &P| {
                Box::pin(async move {
                    match action {
                        Action::Load => {
                            log::info!("load '{id}'");
                            Ok(())
                        }
                        Action::Create => {
                            log::info!("create '{id}':");
                            let output =
                                local.create(provider).await.map_err(|error| Error::Create {
                                    name: id.clone(),
                                    error: Box::new(error),
                                })?;
                            var.set(Some(output.clone()));
                            let mut depends_on = reads.lock().unwrap().clone();
                            depends_on.sort_unstable();
                            depends_on.dedup();
                            let entry = StateEntry {
                                type_name: std::any::type_name::<T>().to_owned(),
                                local: serde_json::to_value(&local).context(SerializeSnafu {
                                    name: id.clone(),
                                })?,
                                remote: serde_json::to_value(&output).context(SerializeSnafu {
                                    name: format!("remote {id}"),
                                })?,
                                parent,
                                depends_on,
                            };
                            let snapshot = {
                                let mut guard = state.lock().unwrap();
                                guard.resources.insert(id.clone(), entry);
                                guard.clone()
                            };
                            save_state(&snapshot, &path).await?;
                            log::info!("  '{id}' is realized");
                            Ok(())
                        }
                        Action::Destroy => Ok(()),
                    }
                }) as Pin<Box<dyn Future<Output = Result<()>> + '_>>
            })
        };

        self.index.insert(id.to_owned(), self.declarations.len());
        if let Some(parent) = &parent {
            self.children
                .entry(parent.clone())
                .or_default()
                .push(id.to_owned());
        }
        self.declarations.push(Declaration {
            id: id.to_owned(),
            action,
            type_name: std::any::type_name::<T>(),
            parent,
            reads,
            run,
        });

        Ok(DeclaredResource {
            id: id.to_owned(),
            local: local_definition,
            action,
            var,
        })
    }

    /// Add an explicit ordering edge: `dependent` is realized only after
    /// `dependency`, even though no remote value flows between them.
    pub fn add_dependency<A, B, C, D>(
        &mut self,
        dependent: &DeclaredResource<A, B>,
        dependency: &DeclaredResource<C, D>,
    ) -> Result<()> {
        snafu::ensure!(
            self.index.contains_key(&dependency.id),
            MissingResourceSnafu {
                name: dependency.id.clone(),
            }
        );
        let ix = self
            .index
            .get(&dependent.id)
            .context(MissingResourceSnafu {
                name: dependent.id.clone(),
            })?;
        self.declarations[*ix]
            .reads
            .lock()
            .unwrap()
            .push(dependency.id.clone());
        Ok(())
    }

    /// Register a named deployment output, resolved when the plan is applied.
    pub fn export(&mut self, name: impl Into<String>, value: Remote<String>) {
        self.exports.push((name.into(), value));
    }

    /// The names of everything declared so far, in declaration order.
    pub fn declared_ids(&self) -> Vec<String> {
        self.declarations.iter().map(|d| d.id.clone()).collect()
    }

    /// The dependency edges (implicit and explicit) of a declaration.
    pub fn dependencies_of(&self, id: &str) -> Option<Vec<String>> {
        let ix = self.index.get(id)?;
        let mut deps = self.declarations[*ix].reads.lock().unwrap().clone();
        deps.sort_unstable();
        deps.dedup();
        Some(deps)
    }

    /// The owning component of a declaration, if any.
    pub fn parent_of(&self, id: &str) -> Option<String> {
        let ix = self.index.get(id)?;
        self.declarations[*ix].parent.clone()
    }

    /// The resources declared inside a component, in declaration order.
    pub fn children_of(&self, component: &str) -> Vec<String> {
        self.children.get(component).cloned().unwrap_or_default()
    }

    /// The outputs recorded by the last successful apply.
    pub fn outputs(&self) -> BTreeMap<String, String> {
        self.state.lock().unwrap().outputs.clone()
    }

    /// Names of resources whose dependency or parent edges point at `id`,
    /// restricted to the given set.
    fn dependents_within(
        entries: &BTreeMap<String, StateEntry>,
        id: &str,
        within: &HashMap<String, usize>,
    ) -> Vec<usize> {
        let mut keys = vec![];
        for (other_id, other) in entries.iter() {
            if other_id == id {
                continue;
            }
            let depends = other.depends_on.iter().any(|d| d == id)
                || other.parent.as_deref() == Some(id);
            if depends {
                if let Some(key) = within.get(other_id) {
                    keys.push(*key);
                }
            }
        }
        keys
    }

    fn destroy_run(&self, id: &str, entry: StateEntry) -> Option<RunFn<P>> {
        if entry.type_name == COMPONENT_TYPE_NAME {
            Some(remove_entry_run(
                id.to_owned(),
                self.state.clone(),
                self.state_file(),
            ))
        } else {
            let deleter = self.deleters.get(&entry.type_name)?;
            Some((deleter.make_run)(id.to_owned(), entry))
        }
    }

    fn build_plan(
        &self,
        dag: dagga::Dag<StackNode<P>, usize>,
        warnings: Vec<String>,
        teardown: bool,
    ) -> Result<Plan<P>> {
        let schedule = dag
            .build_schedule()
            .map_err(|e| Error::Schedule { msg: e.to_string() })?;
        let mut actions = vec![];
        for (i, batch) in schedule.batches.iter().enumerate() {
            for node in batch.iter() {
                let inner = node.inner();
                actions.push(PlannedAction {
                    id: inner.id.clone(),
                    action: inner.action,
                    type_name: inner.type_name.clone(),
                    step: i + 1,
                    is_orphan: inner.is_orphan,
                });
            }
        }
        Ok(Plan {
            actions,
            warnings,
            teardown,
            schedule,
        })
    }

    /// Build an execution plan from the collected declarations.
    ///
    /// The plan is a structural artifact: every dependency and parent edge is
    /// resolved and scheduled before any remote call happens, so it can be
    /// inspected (or asserted on) ahead of [`Stack::apply`].
    ///
    /// State entries with no matching declaration are orphans. Orphans whose
    /// resource type was declared somewhere this run are scheduled for
    /// destruction, dependents and children first; the rest produce warnings.
    pub fn plan(&mut self) -> Result<Plan<P>> {
        let mut dag = dagga::Dag::<StackNode<P>, usize>::default();
        let mut warnings = vec![];

        let declarations = std::mem::take(&mut self.declarations);
        let declared = declarations.len();
        for (key, declaration) in declarations.into_iter().enumerate() {
            let mut reads = vec![];
            {
                let deps = declaration.reads.lock().unwrap();
                for dep in deps.iter() {
                    let dep_key = self.index.get(dep).context(MissingResourceSnafu {
                        name: dep.clone(),
                    })?;
                    reads.push(*dep_key);
                }
            }
            reads.sort_unstable();
            reads.dedup();
            let node_name = format!("{} {}", declaration.action, declaration.id);
            log::debug!("adding node {node_name}");
            dag.add_node(
                Node::new(StackNode {
                    id: declaration.id,
                    action: declaration.action,
                    type_name: declaration.type_name.to_owned(),
                    is_orphan: false,
                    run: declaration.run,
                })
                .with_name(node_name)
                .with_reads(reads)
                .with_result(key),
            );
        }

        // Orphan detection: state entries nobody declared this run.
        let entries = self.state.lock().unwrap().resources.clone();
        let mut orphan_keys = HashMap::<String, usize>::default();
        let mut next_key = declared;
        for (id, entry) in entries.iter() {
            if self.index.contains_key(id) {
                continue;
            }
            if entry.type_name != COMPONENT_TYPE_NAME
                && !self.deleters.contains_key(&entry.type_name)
            {
                warnings.push(format!(
                    "Orphaned resource '{id}' (type: {ty}) is in the deployment state but \
                     its type was not declared this run, so it cannot be destroyed \
                     automatically. Declare a resource of that type or remove the entry \
                     manually.",
                    ty = entry.type_name,
                ));
                continue;
            }
            orphan_keys.insert(id.clone(), next_key);
            next_key += 1;
        }
        for (id, entry) in entries.iter() {
            let Some(key) = orphan_keys.get(id) else {
                continue;
            };
            let entry = entry.clone();
            log::info!("orphan detected: '{id}', scheduling destroy");
            // Reversed edges: whatever depends on this orphan is destroyed
            // before it.
            let reads = Self::dependents_within(&entries, id, &orphan_keys);
            let run = self
                .destroy_run(id, entry.clone())
                .expect("orphans without a deleter were filtered out above");
            let node_name = format!("destroy {id}");
            dag.add_node(
                Node::new(StackNode {
                    id: id.clone(),
                    action: Action::Destroy,
                    type_name: entry.type_name,
                    is_orphan: true,
                    run,
                })
                .with_name(node_name)
                .with_reads(reads)
                .with_result(*key),
            );
        }

        self.build_plan(dag, warnings, false)
    }

    /// Build a plan that destroys every resource in the deployment state,
    /// dependents and children first.
    ///
    /// Declarations made this run are used only to register resource types;
    /// they are discarded, not applied.
    pub fn teardown(&mut self) -> Result<Plan<P>> {
        self.declarations.clear();
        self.index.clear();
        self.children.clear();
        self.exports.clear();

        let mut dag = dagga::Dag::<StackNode<P>, usize>::default();
        let mut warnings = vec![];
        let entries = self.state.lock().unwrap().resources.clone();

        let mut keys = HashMap::<String, usize>::default();
        for id in entries.keys() {
            let entry = &entries[id];
            if entry.type_name != COMPONENT_TYPE_NAME
                && !self.deleters.contains_key(&entry.type_name)
            {
                warnings.push(format!(
                    "Cannot destroy '{id}' (type: {ty}): its type was not declared this \
                     run, so no deleter is registered for it.",
                    ty = entry.type_name,
                ));
                continue;
            }
            let key = keys.len();
            keys.insert(id.clone(), key);
        }

        for (id, entry) in entries.iter() {
            let Some(key) = keys.get(id) else {
                continue;
            };
            let entry = entry.clone();
            let reads = Self::dependents_within(&entries, id, &keys);
            let run = self
                .destroy_run(id, entry.clone())
                .expect("entries without a deleter were filtered out above");
            let node_name = format!("destroy {id}");
            dag.add_node(
                Node::new(StackNode {
                    id: id.clone(),
                    action: Action::Destroy,
                    type_name: entry.type_name,
                    is_orphan: false,
                    run,
                })
                .with_name(node_name)
                .with_reads(reads)
                .with_result(*key),
            );
        }

        self.build_plan(dag, warnings, true)
    }

    /// Execute a plan previously built by [`Stack::plan`] or
    /// [`Stack::teardown`].
    ///
    /// Returns the resolved deployment outputs (empty for teardowns). The
    /// state file is written after every resource-level action, so a partial
    /// failure leaves the realized prefix recorded and the dependency
    /// ordering intact.
    pub async fn apply(&mut self, plan: Plan<P>) -> Result<BTreeMap<String, String>> {
        let teardown = plan.teardown;
        for (i, batch) in plan.schedule.batches.into_iter().enumerate() {
            for node in batch.into_iter() {
                log::debug!("applying '{}' from batch {i}", node.name());
                let stack_node = node.into_inner();
                (stack_node.run)(&self.provider).await?;
            }
        }

        if teardown {
            let snapshot = {
                let mut guard = self.state.lock().unwrap();
                guard.outputs.clear();
                guard.clone()
            };
            save_state(&snapshot, &self.state_file()).await?;
            return Ok(BTreeMap::default());
        }

        let mut outputs = BTreeMap::default();
        for (name, value) in self.exports.iter() {
            let resolved = value.get().map_err(|e| Error::Output {
                name: name.clone(),
                msg: e.to_string(),
            })?;
            outputs.insert(name.clone(), resolved);
        }
        let snapshot = {
            let mut guard = self.state.lock().unwrap();
            guard.outputs = outputs.clone();
            guard.clone()
        };
        save_state(&snapshot, &self.state_file()).await?;
        Ok(outputs)
    }
}
