use crate::{errors::ControllerError, store::ObjectStore};
use json_patch::diff;
use kube::ResourceExt;
use openshift_builds_operator_apis::OpenShiftBuild;
use serde_json::json;
use std::ops::DerefMut;

/// Helper construct to simplify updating and persisting [`OpenShiftBuild`] objects.
///
/// Changes are made on `modified`; the `persist_*` methods only talk to the
/// API server if `modified` differs from the last persisted state, so a
/// converged pass does not produce watch events of its own.
pub(crate) struct OpenShiftBuildModifications {
    original: OpenShiftBuild,
    pub modified: OpenShiftBuild,
}

impl std::ops::Deref for OpenShiftBuildModifications {
    type Target = OpenShiftBuild;

    fn deref(&self) -> &Self::Target {
        &self.modified
    }
}

impl DerefMut for OpenShiftBuildModifications {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.modified
    }
}

impl OpenShiftBuildModifications {
    pub(crate) fn new(original: OpenShiftBuild) -> Self {
        let modified = original.clone();
        Self { original, modified }
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    fn status_has_changed(&self) -> Result<bool, ControllerError> {
        let patch = diff(
            &serde_json::to_value(&self.original.status)?,
            &serde_json::to_value(&self.modified.status)?,
        );
        Ok(!patch.0.is_empty())
    }

    /// Only spec and finalizers are modified by the controller, everything
    /// else in the metadata is owned by the API server.
    fn spec_has_changed(&self) -> Result<bool, ControllerError> {
        let owned = |o: &OpenShiftBuild| -> Result<serde_json::Value, ControllerError> {
            Ok(json!({
                "spec": serde_json::to_value(&o.spec)?,
                "finalizers": o.finalizers(),
            }))
        };
        let patch = diff(&owned(&self.original)?, &owned(&self.modified)?);
        Ok(!patch.0.is_empty())
    }

    fn accept(&mut self, latest: OpenShiftBuild) {
        self.original = latest.clone();
        self.modified = latest;
    }

    /// Persist the status sub-resource if it changed.
    pub(crate) async fn persist_status(
        &mut self,
        store: &dyn ObjectStore<OpenShiftBuild>,
    ) -> Result<(), ControllerError> {
        if self.status_has_changed()? {
            let latest = store.replace_status(&self.modified).await?;
            debug!(
                "replaced status of {} -> {}",
                self.original.versioned_id(),
                latest.resource_version().unwrap_or_default()
            );
            // Pending spec changes stay on `modified`, they are persisted separately.
            self.modified.metadata.resource_version = latest.metadata.resource_version.clone();
            self.original = latest;
        }
        Ok(())
    }

    /// Persist spec and metadata if they changed.
    pub(crate) async fn persist_spec(
        &mut self,
        store: &dyn ObjectStore<OpenShiftBuild>,
    ) -> Result<(), ControllerError> {
        if self.spec_has_changed()? {
            self.modified.metadata.managed_fields = Default::default();
            let latest = store.replace(&self.modified).await?;
            debug!(
                "replaced {} -> {}",
                self.original.versioned_id(),
                latest.resource_version().unwrap_or_default()
            );
            self.accept(latest);
        }
        Ok(())
    }
}
