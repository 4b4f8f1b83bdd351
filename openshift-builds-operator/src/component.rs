use async_trait::async_trait;
use kube::{Resource, ResourceExt, api::ObjectMeta};
use openshift_builds_operator_apis::{
    OpenShiftBuild, SharedResource, SharedResourceSpec, ShipwrightBuild, ShipwrightBuildSpec,
};
use serde::{Serialize, de::DeserializeOwned};
use std::{fmt, sync::Arc};

use crate::{
    FINALIZER,
    errors::ControllerError,
    store::ObjectStore,
    utils::{add_finalizer, is_controlled_by, remove_finalizer, set_controller_reference},
};

/// Outcome of an idempotent create-or-update call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OperationResult {
    Created,
    Updated,
    None,
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationResult::Created => f.write_str("created"),
            OperationResult::Updated => f.write_str("updated"),
            OperationResult::None => f.write_str("unchanged"),
        }
    }
}

/// Lifecycle of one component installed on behalf of an [`OpenShiftBuild`].
#[async_trait]
pub(crate) trait ComponentManager: Send + Sync {
    /// Kind of the managed object, used to identify the component in logs and
    /// status messages.
    fn kind(&self) -> String;

    /// Converge the component towards its installed state.
    async fn create_or_update(
        &self,
        owner: &OpenShiftBuild,
    ) -> Result<OperationResult, ControllerError>;

    /// Remove the component. Returns a not-found error if there is nothing
    /// to remove, callers decide whether that is fine.
    async fn delete(&self, owner: &OpenShiftBuild) -> Result<(), ControllerError>;
}

/// A custom resource type that represents one installed component.
pub(crate) trait OwnedComponent:
    Resource<DynamicType = ()>
    + Clone
    + PartialEq
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    fn from_metadata(metadata: ObjectMeta) -> Self;

    /// Overwrite the fields this operator owns with their desired values.
    fn apply_desired(&mut self, target_namespace: &str);
}

impl OwnedComponent for ShipwrightBuild {
    fn from_metadata(metadata: ObjectMeta) -> Self {
        ShipwrightBuild {
            metadata,
            spec: ShipwrightBuildSpec::default(),
            status: None,
        }
    }

    fn apply_desired(&mut self, target_namespace: &str) {
        self.spec = ShipwrightBuildSpec {
            target_namespace: target_namespace.to_string(),
        };
    }
}

impl OwnedComponent for SharedResource {
    fn from_metadata(metadata: ObjectMeta) -> Self {
        SharedResource {
            metadata,
            spec: SharedResourceSpec::default(),
            status: None,
        }
    }

    fn apply_desired(&mut self, target_namespace: &str) {
        self.spec = SharedResourceSpec {
            target_namespace: target_namespace.to_string(),
        };
    }
}

/// Keeps exactly one `K` per owner, found through its controller reference
/// rather than by name.
pub(crate) struct OwnedResourceManager<K> {
    store: Arc<dyn ObjectStore<K>>,
    target_namespace: String,
}

impl<K: OwnedComponent> OwnedResourceManager<K> {
    pub fn new(store: Arc<dyn ObjectStore<K>>, target_namespace: impl Into<String>) -> Self {
        Self {
            store,
            target_namespace: target_namespace.into(),
        }
    }

    /// The first `K` controlled by `owner`.
    pub async fn get(&self, owner: &OpenShiftBuild) -> Result<K, ControllerError> {
        self.store
            .list()
            .await?
            .into_iter()
            .find(|item| is_controlled_by(item, owner))
            .ok_or_else(|| ControllerError::not_found(&K::kind(&()), &owner.name_any()))
    }

    fn mutate(&self, owner: &OpenShiftBuild, object: &mut K) -> Result<(), ControllerError> {
        object.apply_desired(&self.target_namespace);
        add_finalizer(object, FINALIZER);
        set_controller_reference(owner, object)?;
        Ok(())
    }
}

#[async_trait]
impl<K: OwnedComponent> ComponentManager for OwnedResourceManager<K> {
    fn kind(&self) -> String {
        K::kind(&()).to_string()
    }

    async fn create_or_update(
        &self,
        owner: &OpenShiftBuild,
    ) -> Result<OperationResult, ControllerError> {
        let existing = match self.get(owner).await {
            Ok(existing) => Some(existing),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        match existing {
            None => {
                let mut object = K::from_metadata(ObjectMeta {
                    generate_name: Some(format!("{}-", owner.name_any())),
                    ..Default::default()
                });
                self.mutate(owner, &mut object)?;
                let created = self.store.create(&object).await?;
                debug!("created {} {}", self.kind(), created.name_any());
                Ok(OperationResult::Created)
            }
            Some(current) if current.meta().deletion_timestamp.is_some() => {
                // No finalizers can be added to a terminating object, wait for
                // it to go away and create a new one.
                debug!("{} {} is still terminating", self.kind(), current.name_any());
                Err(ControllerError::Terminating {
                    kind: self.kind(),
                    name: current.name_any(),
                })
            }
            Some(current) => {
                let mut object = current.clone();
                self.mutate(owner, &mut object)?;
                if object == current {
                    Ok(OperationResult::None)
                } else {
                    self.store.replace(&object).await?;
                    debug!("updated {} {}", self.kind(), object.name_any());
                    Ok(OperationResult::Updated)
                }
            }
        }
    }

    async fn delete(&self, owner: &OpenShiftBuild) -> Result<(), ControllerError> {
        let mut object = self.get(owner).await?;
        // Persist the finalizer removal first, otherwise the delete below would
        // leave the object terminating until someone else clears it.
        if remove_finalizer(&mut object, FINALIZER) {
            object = self.store.replace(&object).await?;
        }
        self.store.delete(object.name_any().as_str()).await?;
        debug!("deleted {} {}", self.kind(), object.name_any());
        Ok(())
    }
}
