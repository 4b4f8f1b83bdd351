use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use crate::errors::ControllerError;

/// Add `finalizer` unless already present. Returns `true` if it was added.
pub(crate) fn add_finalizer<T: Resource>(object: &mut T, finalizer: &str) -> bool {
    let finalizers = object.finalizers_mut();
    if finalizers.iter().any(|f| f.as_str() == finalizer) {
        false
    } else {
        finalizers.push(finalizer.to_string());
        true
    }
}

/// Remove every occurrence of `finalizer`. Returns `true` if one was removed.
pub(crate) fn remove_finalizer<T: Resource>(object: &mut T, finalizer: &str) -> bool {
    let finalizers = object.finalizers_mut();
    let len = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    finalizers.len() != len
}

#[cfg(test)]
pub(crate) fn has_finalizer<T: Resource>(object: &T, finalizer: &str) -> bool {
    object.finalizers().iter().any(|f| f.as_str() == finalizer)
}

/// Whether `object` carries a controller reference pointing at `owner`.
///
/// Owners are matched by UID, so a re-created owner with the same name does
/// not adopt the objects of its predecessor.
pub(crate) fn is_controlled_by<T, O>(object: &T, owner: &O) -> bool
where
    T: Resource,
    O: Resource,
{
    let uid = match owner.meta().uid.as_deref() {
        Some(uid) => uid,
        None => return false,
    };
    object
        .owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}

/// Make `owner` the controller of `object`, replacing any previous reference
/// to the same owner. Returns `true` if the references changed.
pub(crate) fn set_controller_reference<T, O>(
    owner: &O,
    object: &mut T,
) -> Result<bool, ControllerError>
where
    T: Resource,
    O: Resource<DynamicType = ()>,
{
    let reference = owner.controller_owner_ref(&()).ok_or_else(|| {
        ControllerError::InvalidOwner(format!(
            "{} {} has no name or uid, cannot reference it as controller",
            O::kind(&()),
            owner.meta().name.as_deref().unwrap_or("")
        ))
    })?;
    // Foreground deletion of the owner waits for the object.
    let reference = OwnerReference {
        block_owner_deletion: Some(true),
        ..reference
    };
    let references = object.owner_references_mut();
    if references.len() == 1 && references[0] == reference {
        return Ok(false);
    }
    let original = references.clone();
    references.retain(|r| r.uid != reference.uid && r.controller != Some(true));
    references.push(reference);
    Ok(*references != original)
}

pub(crate) fn metric_name(name: &str) -> String {
    format!("openshift_builds_{}", name)
}
