use crate::{
    Configuration, FINALIZER,
    bootstrap::{apply_defaults, create_or_update},
    component::{ComponentManager, OwnedResourceManager},
    errors::{ControllerError, ExtKubeApiError},
    openshift_build_modifications::OpenShiftBuildModifications,
    store::ObjectStore,
    utils::{metric_name, remove_finalizer},
};

use futures::{Stream, StreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::{
    WatchStreamExt,
    controller::{Action, Controller},
    predicates, reflector,
    watcher::{self, Config, watcher},
};
use openshift_builds_operator_apis::{
    CONDITION_READY, Condition, OPENSHIFT_BUILD_RESOURCE_NAME, OpenShiftBuild, SharedResource,
    ShipwrightBuild, State,
};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};
use tokio::time::{Duration, sleep};

pub(crate) const INITIALIZING: &'static str = "Initializing";
pub(crate) const SUCCESS: &'static str = "Success";
pub(crate) const FAILED: &'static str = "Failed";

const OPENSHIFT_BUILD_CONTROLLER: &'static str = "openshift_build_controller";

/// Delay before the first retry of a failed reconcile, doubled on every
/// consecutive failure up to [`BACKOFF_MAX`].
const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Requeue delay right after the root object was created.
const BOOTSTRAP_REQUEUE: Duration = Duration::from_secs(1);

/// Drives the managed components of the singleton [`OpenShiftBuild`] towards
/// the desired state in its spec.
///
/// Components are reconciled in a fixed order, Shipwright Build first, then
/// the Shared Resources CSI driver. A failing component does not keep the
/// other one from being reconciled, all failures end up in the `Ready`
/// condition and the first one is returned to the controller runtime.
pub(crate) struct OpenShiftBuildController {
    store: Arc<dyn ObjectStore<OpenShiftBuild>>,
    shipwright_build: Arc<dyn ComponentManager>,
    shared_resource: Arc<dyn ComponentManager>,
    /// Name of the singleton, only this one is re-created when missing.
    root_name: String,
    /// Consecutive failures per object, drives the retry delay.
    failures: Mutex<HashMap<String, u32>>,
    reconcile_count: Counter<u64>,
    reconcile_duration: Histogram<u64>,
}

impl OpenShiftBuildController {
    pub fn new(configuration: &Configuration) -> Self {
        let client = configuration.client.clone();
        let roots: Api<OpenShiftBuild> = Api::all(client.clone());
        let shipwright_builds: Api<ShipwrightBuild> = Api::all(client.clone());
        let shared_resources: Api<SharedResource> = Api::all(client);
        Self::with_managers(
            Arc::new(roots),
            Arc::new(OwnedResourceManager::<ShipwrightBuild>::new(
                Arc::new(shipwright_builds),
                &configuration.target_namespace,
            )),
            Arc::new(OwnedResourceManager::<SharedResource>::new(
                Arc::new(shared_resources),
                &configuration.target_namespace,
            )),
        )
    }

    pub fn with_managers(
        store: Arc<dyn ObjectStore<OpenShiftBuild>>,
        shipwright_build: Arc<dyn ComponentManager>,
        shared_resource: Arc<dyn ComponentManager>,
    ) -> Self {
        let meter: Meter = global::meter(OPENSHIFT_BUILD_CONTROLLER);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of OpenShiftBuild reconcile invocations")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration of OpenShiftBuild objects in milliseconds")
            .with_unit("ms")
            .build();
        Self {
            store,
            shipwright_build,
            shared_resource,
            root_name: OPENSHIFT_BUILD_RESOURCE_NAME.to_string(),
            failures: Default::default(),
            reconcile_count,
            reconcile_duration,
        }
    }

    fn condition(
        event: &OpenShiftBuild,
        status: Option<bool>,
        reason: &str,
        message: impl Into<String>,
    ) -> Condition {
        let mut condition = Condition::new(CONDITION_READY, status, reason, message.into());
        condition.observed_generation = event.metadata.generation;
        condition
    }

    /// The root object is gone. Re-create the singleton, anything else is
    /// none of our business.
    async fn missing(&self, name: &str) -> Result<Action, ControllerError> {
        if name != self.root_name {
            debug!("ignoring removed OpenShiftBuild {}", name);
            return Ok(Action::await_change());
        }
        info!("OpenShiftBuild {} not found, creating it", name);
        let result = create_or_update(self.store.as_ref(), name).await?;
        info!("OpenShiftBuild {} {}", name, result);
        Ok(Action::requeue(BOOTSTRAP_REQUEUE))
    }

    async fn initialize_status(
        &self,
        event: &mut OpenShiftBuildModifications,
    ) -> Result<(), ControllerError> {
        info!("initializing status of {}", event.id());
        let condition = Self::condition(
            event,
            None,
            INITIALIZING,
            "Initializing OpenShift Builds Operator",
        );
        event.update_condition(condition);
        event.persist_status(self.store.as_ref()).await
    }

    /// Remove every component, then release the root object. Returns `true`
    /// if the finalizer was removed in this pass.
    async fn delete(&self, event: &mut OpenShiftBuildModifications) -> Result<bool, ControllerError> {
        info!("{} is being deleted, removing its components", event.id());
        for manager in [&self.shipwright_build, &self.shared_resource] {
            match manager.delete(event).await {
                Ok(()) => info!("removed {} of {}", manager.kind(), event.id()),
                Err(e) if e.is_not_found() => {
                    debug!("no {} left for {}", manager.kind(), event.id())
                }
                Err(e) => {
                    error!(
                        "failed to remove {} of {}: {}",
                        manager.kind(),
                        event.id(),
                        e
                    );
                    return Err(e);
                }
            }
        }
        if remove_finalizer(&mut event.modified, FINALIZER) {
            event.persist_spec(self.store.as_ref()).await?;
            info!("released {}", event.id());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn reconcile_component(
        &self,
        manager: &dyn ComponentManager,
        state: State,
        owner: &OpenShiftBuild,
    ) -> Result<(), ControllerError> {
        match state {
            State::Enabled => {
                let result = manager.create_or_update(owner).await?;
                info!("{} of {} {}", manager.kind(), owner.id(), result);
                Ok(())
            }
            State::Disabled => match manager.delete(owner).await {
                Ok(()) => {
                    info!("removed disabled {} of {}", manager.kind(), owner.id());
                    Ok(())
                }
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e),
            },
            State::Unknown(state) => Err(ControllerError::UnknownComponentState {
                component: manager.kind(),
                state,
            }),
        }
    }

    async fn apply(&self, event: &mut OpenShiftBuildModifications) -> Result<Action, ControllerError> {
        if apply_defaults(&mut event.modified) {
            info!("setting defaults of {}", event.id());
            event.persist_spec(self.store.as_ref()).await?;
        }
        let components = [
            (&self.shipwright_build, event.spec.shipwright_build_state()),
            (&self.shared_resource, event.spec.shared_resource_state()),
        ];
        let mut failures = Vec::new();
        let mut first_error = None;
        for (manager, state) in components {
            if let Err(e) = self
                .reconcile_component(manager.as_ref(), state, event)
                .await
            {
                warn!(
                    "failed to reconcile {} of {}: {}",
                    manager.kind(),
                    event.id(),
                    e
                );
                failures.push(format!("{}: {}", manager.kind(), e));
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => {
                let condition = Self::condition(
                    event,
                    Some(false),
                    FAILED,
                    format!(
                        "Failed to reconcile OpenShiftBuild: {}",
                        failures.join("; ")
                    ),
                );
                event.update_condition(condition);
                // A failing status write wins over the component error.
                event.persist_status(self.store.as_ref()).await?;
                Err(e)
            }
            None => {
                let condition = Self::condition(
                    event,
                    Some(true),
                    SUCCESS,
                    "Successfully reconciled OpenShiftBuild",
                );
                event.update_condition(condition);
                event.persist_status(self.store.as_ref()).await?;
                debug!("{} is ready", event.id());
                Ok(Action::await_change())
            }
        }
    }

    /// One pass of the state machine for the [`OpenShiftBuild`] named `name`,
    /// always working on a fresh copy from the API server.
    pub(crate) async fn reconcile_by_name(&self, name: &str) -> Result<Action, ControllerError> {
        let root = match self.store.get(name).await {
            Ok(root) => root,
            Err(e) if e.is_not_found() => return self.missing(name).await,
            Err(e) => return Err(e.into()),
        };
        let mut event = OpenShiftBuildModifications::new(root);
        if !event.has_conditions() {
            self.initialize_status(&mut event).await?;
        }
        if event.is_deleted() {
            return if self.delete(&mut event).await? {
                // Deletions do not pass the watch filter, look again to
                // re-create the singleton once it is gone.
                Ok(Action::requeue(BOOTSTRAP_REQUEUE))
            } else {
                Ok(Action::await_change())
            };
        }
        self.apply(&mut event).await
    }

    /// Controller triggers this whenever our main object or one of its
    /// components changed
    async fn reconcile(object: Arc<OpenShiftBuild>, ctx: Arc<Self>) -> Result<Action, ControllerError> {
        let me = ctx.as_ref();
        let name = object.name_any();
        let start = Instant::now();
        let result = me.reconcile_by_name(&name).await;
        let duration = Instant::now() - start;
        let labels = &[KeyValue::new("object_name", name.clone())];
        me.reconcile_count.add(1, labels);
        me.reconcile_duration
            .record(duration.as_millis() as u64, labels);
        if result.is_ok() {
            me.reset_backoff(&name);
        }
        result
    }

    fn next_backoff(&self, name: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let attempts = failures.entry(name.to_string()).or_insert(0);
        let delay = BACKOFF_BASE
            .saturating_mul(2u32.saturating_pow(*attempts))
            .min(BACKOFF_MAX);
        *attempts = attempts.saturating_add(1);
        delay
    }

    fn reset_backoff(&self, name: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    /// The controller triggers this on reconcile errors
    fn error_policy(object: Arc<OpenShiftBuild>, error: &ControllerError, ctx: Arc<Self>) -> Action {
        if error.is_temporary() {
            let delay = ctx.next_backoff(&object.name_any());
            debug!(
                "retrying {} in {}s: {}",
                object.id(),
                delay.as_secs(),
                error
            );
            Action::requeue(delay)
        } else {
            warn!("{} is misconfigured: {}", object.id(), error);
            Action::requeue(BACKOFF_MAX)
        }
    }

    pub fn start(self, client: Client) -> impl Future<Output = ()> {
        let ctx = Arc::new(self);
        let roots: Api<OpenShiftBuild> = Api::all(client.clone());
        let shipwright_builds: Api<ShipwrightBuild> = Api::all(client.clone());
        let shared_resources: Api<SharedResource> = Api::all(client);
        let (store, writer) = reflector::store();
        let roots = reflector(writer, watcher(roots, Config::default())).default_backoff();
        let shipwright_builds = watcher(shipwright_builds, Config::default()).default_backoff();
        let shared_resources = watcher(shared_resources, Config::default()).default_backoff();
        Controller::for_stream(generation_changes(roots), store)
            .owns_stream(generation_changes(shipwright_builds))
            .owns_stream(generation_changes(shared_resources))
            .shutdown_on_signal()
            .run(Self::reconcile, Self::error_policy, ctx.clone())
            .for_each(move |res| {
                let ctx = ctx.clone();
                async move {
                    match res {
                        Ok(o) => {
                            debug!("reconciled {:?}", o);
                        }
                        Err(e) => {
                            let meter: Meter = global::meter(OPENSHIFT_BUILD_CONTROLLER);
                            let reconcile_errors = meter
                                .u64_counter(metric_name("reconcile_errors"))
                                .with_description(
                                    "Count of reconcile invocation errors for OpenShiftBuild resources",
                                )
                                .build();
                            let labels = &[];
                            match e {
                                a @ kube_runtime::controller::Error::QueueError { .. } => {
                                    debug!("reconcile failed: {:?}", a);
                                    reconcile_errors.add(1, labels);
                                    // Slow down on errors caused by missing CRDs or permissions.
                                    sleep(Duration::from_secs(30)).await;
                                }
                                kube_runtime::controller::Error::ObjectNotFound(object_ref) => {
                                    // The runtime does not call reconcile for removed objects.
                                    if let Err(e) = ctx.missing(&object_ref.name).await {
                                        warn!(
                                            "failed to re-create OpenShiftBuild {}: {}",
                                            object_ref.name, e
                                        );
                                        reconcile_errors.add(1, labels);
                                    }
                                }
                                e => {
                                    warn!("reconcile failed: {}", e);
                                    reconcile_errors.add(1, labels);
                                }
                            };
                        }
                    }
                }
            })
    }
}

/// Objects whose `metadata.generation` changed.
///
/// Status updates, including our own, do not trigger a reconcile. Deletions
/// are dropped: managed objects carry a finalizer, so the API server bumps
/// their generation when it marks them for deletion.
fn generation_changes<K, S>(events: S) -> impl Stream<Item = Result<K, watcher::Error>>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
{
    events
        .applied_objects()
        .predicate_filter(predicates::generation)
}
