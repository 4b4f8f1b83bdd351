use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Api, Client, api::ObjectMeta};
use kube_runtime::wait::{await_condition, conditions};
use openshift_builds_operator_apis::{
    OPENSHIFT_BUILD_CRD_NAME, OPENSHIFT_BUILD_RESOURCE_NAME, OpenShiftBuild, OpenShiftBuildSpec,
};
use std::{fmt::Display, future::Future};
use tokio::time::{Duration, timeout};

use crate::{
    Configuration, FINALIZER,
    component::OperationResult,
    errors::{ControllerError, ExtKubeApiError},
    openshift_build_modifications::OpenShiftBuildModifications,
    store::ObjectStore,
    utils::add_finalizer,
};

/// Inject the default spec and the finalizer. Returns `true` if `object` changed.
pub(crate) fn apply_defaults(object: &mut OpenShiftBuild) -> bool {
    let finalizer_added = add_finalizer(object, FINALIZER);
    let spec_defaulted = object.spec.apply_defaults();
    finalizer_added || spec_defaulted
}

/// Create the [`OpenShiftBuild`] named `name` with defaults, or backfill
/// defaults on the existing one.
pub(crate) async fn create_or_update(
    store: &dyn ObjectStore<OpenShiftBuild>,
    name: &str,
) -> Result<OperationResult, ControllerError> {
    match store.get(name).await {
        Ok(existing) => {
            let mut event = OpenShiftBuildModifications::new(existing);
            if apply_defaults(&mut event) {
                event.persist_spec(store).await?;
                Ok(OperationResult::Updated)
            } else {
                Ok(OperationResult::None)
            }
        }
        Err(e) if e.is_not_found() => {
            let mut object = OpenShiftBuild {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                spec: OpenShiftBuildSpec::default(),
                status: None,
            };
            apply_defaults(&mut object);
            store.create(&object).await?;
            Ok(OperationResult::Created)
        }
        Err(e) => Err(e.into()),
    }
}

/// Wait until the [`OpenShiftBuild`] CRD is established, giving up after `limit`.
pub(crate) async fn wait_for_crd(client: Client, limit: Duration) -> Result<(), ControllerError> {
    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let established = await_condition(
        crds,
        OPENSHIFT_BUILD_CRD_NAME,
        conditions::is_crd_established(),
    );
    bounded(limit, established).await
}

async fn bounded<F, T, E>(limit: Duration, established: F) -> Result<(), ControllerError>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    match timeout(limit, established).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(ControllerError::Bootstrap(format!(
            "failed to watch CustomResourceDefinition {}: {}",
            OPENSHIFT_BUILD_CRD_NAME, e
        ))),
        Err(_) => Err(ControllerError::Bootstrap(format!(
            "CustomResourceDefinition {} not established within {}s",
            OPENSHIFT_BUILD_CRD_NAME,
            limit.as_secs()
        ))),
    }
}

/// Make sure the singleton [`OpenShiftBuild`] exists before the controller
/// starts watching. Safe to run on every start.
pub(crate) async fn bootstrap(configuration: &Configuration) -> Result<(), ControllerError> {
    wait_for_crd(configuration.client.clone(), configuration.bootstrap_timeout).await?;
    let api: Api<OpenShiftBuild> = Api::all(configuration.client.clone());
    ensure_root(&api, OPENSHIFT_BUILD_RESOURCE_NAME).await
}

pub(crate) async fn ensure_root(
    store: &dyn ObjectStore<OpenShiftBuild>,
    name: &str,
) -> Result<(), ControllerError> {
    match create_or_update(store, name).await {
        Ok(result) => {
            info!("bootstrap OpenShiftBuild {}: {}", name, result);
            Ok(())
        }
        Err(e) => {
            error!("failed to bootstrap OpenShiftBuild {}: {}", name, e);
            Err(e)
        }
    }
}
