//! In-memory stand-ins for the Kubernetes API used by unit tests.

use async_trait::async_trait;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc};
use kube::{Resource, ResourceExt, api::ObjectMeta, error::ErrorResponse};
use openshift_builds_operator_apis::{OpenShiftBuild, OpenShiftBuildSpec};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use crate::{
    component::{ComponentManager, OperationResult},
    errors::ControllerError,
    store::ObjectStore,
};

pub(crate) fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} ({})", reason, code),
        reason: reason.to_string(),
        code,
    })
}

/// A root object as the API server would return it.
pub(crate) fn owner(name: &str, uid: &str) -> OpenShiftBuild {
    OpenShiftBuild {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(uid.to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: OpenShiftBuildSpec::default(),
        status: None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Verb {
    List,
    Get,
    Create,
    Replace,
    ReplaceStatus,
    Delete,
}

/// One call against a [`FakeStore`], with the finalizers the stored object
/// carried when the call arrived.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Call {
    pub verb: Verb,
    pub name: String,
    pub finalizers: Vec<String>,
}

struct FakeState<K> {
    objects: BTreeMap<String, K>,
    journal: Vec<Call>,
    failures: HashMap<Verb, (u16, String)>,
    sequence: u64,
}

/// [`ObjectStore`] backed by a map, mimicking the API server for cluster
/// scoped objects: generated names, UIDs, `resourceVersion` conflicts,
/// finalizers blocking deletion and the status sub-resource.
pub(crate) struct FakeStore<K> {
    state: Mutex<FakeState<K>>,
}

impl<K> Default for FakeStore<K> {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState {
                objects: Default::default(),
                journal: Default::default(),
                failures: Default::default(),
                sequence: 0,
            }),
        }
    }
}

impl<K> FakeStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Default::default()
    }

    /// Store `obj` as-is, filling in server-side identity if missing.
    pub fn insert(&self, mut obj: K) -> K {
        let mut state = self.state.lock().unwrap();
        state.sequence += 1;
        let sequence = state.sequence;
        let meta = obj.meta_mut();
        meta.uid.get_or_insert_with(|| format!("uid-{}", sequence));
        meta.resource_version = Some(sequence.to_string());
        state.objects.insert(obj.name_any(), obj.clone());
        obj
    }

    pub fn objects(&self) -> Vec<K> {
        self.state.lock().unwrap().objects.values().cloned().collect()
    }

    pub fn find(&self, name: &str) -> Option<K> {
        self.state.lock().unwrap().objects.get(name).cloned()
    }

    pub fn journal(&self) -> Vec<Call> {
        self.state.lock().unwrap().journal.clone()
    }

    /// Writes only, in the order they were issued.
    pub fn writes(&self) -> Vec<Call> {
        self.journal()
            .into_iter()
            .filter(|c| !matches!(c.verb, Verb::List | Verb::Get))
            .collect()
    }

    /// Make every subsequent `verb` call fail with the given API error code.
    pub fn fail(&self, verb: Verb, code: u16, reason: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(verb, (code, reason.to_string()));
    }

    fn record(&self, state: &mut FakeState<K>, verb: Verb, name: &str) -> kube::Result<()> {
        let finalizers = state
            .objects
            .get(name)
            .map(|o| o.finalizers().to_vec())
            .unwrap_or_default();
        state.journal.push(Call {
            verb,
            name: name.to_string(),
            finalizers,
        });
        match state.failures.get(&verb) {
            Some((code, reason)) => Err(api_error(*code, reason)),
            None => Ok(()),
        }
    }

    fn check_version(stored: &K, obj: &K) -> kube::Result<()> {
        match obj.resource_version() {
            Some(rv) if Some(&rv) != stored.meta().resource_version.as_ref() => {
                Err(api_error(409, "Conflict"))
            }
            _ => Ok(()),
        }
    }

    fn with_status_of(obj: &K, status_source: &K) -> kube::Result<K> {
        let mut value = serde_json::to_value(obj).map_err(kube::Error::SerdeError)?;
        let status = serde_json::to_value(status_source)
            .map_err(kube::Error::SerdeError)?
            .get("status")
            .cloned();
        if let Value::Object(map) = &mut value {
            match status {
                Some(status) => map.insert("status".to_string(), status),
                None => map.remove("status"),
            };
        }
        serde_json::from_value(value).map_err(kube::Error::SerdeError)
    }
}

#[async_trait]
impl<K> ObjectStore<K> for FakeStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn list(&self) -> kube::Result<Vec<K>> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, Verb::List, "")?;
        Ok(state.objects.values().cloned().collect())
    }

    async fn get(&self, name: &str) -> kube::Result<K> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, Verb::Get, name)?;
        state
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound"))
    }

    async fn create(&self, obj: &K) -> kube::Result<K> {
        let mut state = self.state.lock().unwrap();
        state.sequence += 1;
        let sequence = state.sequence;
        let mut obj = obj.clone();
        let meta = obj.meta_mut();
        if meta.name.is_none() {
            meta.name = meta
                .generate_name
                .as_ref()
                .map(|prefix| format!("{}{:05}", prefix, sequence));
        }
        let name = meta
            .name
            .clone()
            .ok_or_else(|| api_error(422, "Invalid"))?;
        self.record(&mut state, Verb::Create, &name)?;
        if state.objects.contains_key(&name) {
            return Err(api_error(409, "AlreadyExists"));
        }
        let meta = obj.meta_mut();
        meta.uid = Some(format!("uid-{}", sequence));
        meta.resource_version = Some(sequence.to_string());
        meta.deletion_timestamp = None;
        state.objects.insert(name, obj.clone());
        Ok(obj)
    }

    async fn replace(&self, obj: &K) -> kube::Result<K> {
        let name = obj.name_any();
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, Verb::Replace, &name)?;
        let stored = state
            .objects
            .get(&name)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound"))?;
        Self::check_version(&stored, obj)?;
        if stored.meta().deletion_timestamp.is_some()
            && obj
                .finalizers()
                .iter()
                .any(|f| !stored.finalizers().contains(f))
        {
            // no new finalizers can be added if the object is being deleted
            return Err(api_error(422, "Invalid"));
        }
        let mut updated = Self::with_status_of(obj, &stored)?;
        state.sequence += 1;
        let meta = updated.meta_mut();
        meta.uid = stored.meta().uid.clone();
        meta.deletion_timestamp = stored.meta().deletion_timestamp.clone();
        meta.resource_version = Some(state.sequence.to_string());
        if updated.meta().deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            // Last finalizer gone on a terminating object: the API server removes it.
            state.objects.remove(&name);
        } else {
            state.objects.insert(name, updated.clone());
        }
        Ok(updated)
    }

    async fn replace_status(&self, obj: &K) -> kube::Result<K> {
        let name = obj.name_any();
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, Verb::ReplaceStatus, &name)?;
        let stored = state
            .objects
            .get(&name)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound"))?;
        Self::check_version(&stored, obj)?;
        let mut updated = Self::with_status_of(&stored, obj)?;
        state.sequence += 1;
        updated.meta_mut().resource_version = Some(state.sequence.to_string());
        state.objects.insert(name, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, name: &str) -> kube::Result<()> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, Verb::Delete, name)?;
        let mut stored = state
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound"))?;
        if stored.finalizers().is_empty() {
            state.objects.remove(name);
        } else if stored.meta().deletion_timestamp.is_none() {
            state.sequence += 1;
            let meta = stored.meta_mut();
            meta.deletion_timestamp = Some(Time(Utc::now()));
            meta.resource_version = Some(state.sequence.to_string());
            state.objects.insert(name.to_string(), stored);
        }
        Ok(())
    }
}

/// Scripted outcome of a [`FakeManager`] call.
#[derive(Clone, Debug)]
pub(crate) enum Outcome {
    Ok(OperationResult),
    NotFound,
    Fail(String),
}

/// [`ComponentManager`] test double returning scripted outcomes and
/// recording the calls it receives as `"create_or_update"` or `"delete"`.
pub(crate) struct FakeManager {
    kind: String,
    create_or_update: Mutex<Outcome>,
    delete: Mutex<Outcome>,
    calls: Mutex<Vec<&'static str>>,
}

impl FakeManager {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            create_or_update: Mutex::new(Outcome::Ok(OperationResult::None)),
            delete: Mutex::new(Outcome::Ok(OperationResult::None)),
            calls: Default::default(),
        }
    }

    pub fn on_create_or_update(self, outcome: Outcome) -> Self {
        *self.create_or_update.lock().unwrap() = outcome;
        self
    }

    pub fn on_delete(self, outcome: Outcome) -> Self {
        *self.delete.lock().unwrap() = outcome;
        self
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn resolve(&self, outcome: Outcome) -> Result<OperationResult, ControllerError> {
        match outcome {
            Outcome::Ok(result) => Ok(result),
            Outcome::NotFound => Err(ControllerError::not_found(&self.kind, "cluster")),
            Outcome::Fail(message) => Err(ControllerError::Any(anyhow::anyhow!(message))),
        }
    }
}

#[async_trait]
impl ComponentManager for FakeManager {
    fn kind(&self) -> String {
        self.kind.clone()
    }

    async fn create_or_update(
        &self,
        _owner: &OpenShiftBuild,
    ) -> Result<OperationResult, ControllerError> {
        self.calls.lock().unwrap().push("create_or_update");
        let outcome = self.create_or_update.lock().unwrap().clone();
        self.resolve(outcome)
    }

    async fn delete(&self, _owner: &OpenShiftBuild) -> Result<(), ControllerError> {
        self.calls.lock().unwrap().push("delete");
        let outcome = self.delete.lock().unwrap().clone();
        self.resolve(outcome).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openshift_builds_operator_apis::{SharedResource, SharedResourceSpec};

    fn generated(prefix: &str) -> SharedResource {
        SharedResource {
            metadata: ObjectMeta {
                generate_name: Some(prefix.to_string()),
                ..Default::default()
            },
            spec: SharedResourceSpec::default(),
            status: None,
        }
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let store = FakeStore::<SharedResource>::new();
        let created = store.create(&generated("cluster-")).await.unwrap();
        assert!(created.name_any().starts_with("cluster-"));
        let mut first = created.clone();
        first.spec.target_namespace = "a".to_string();
        store.replace(&first).await.unwrap();
        let mut second = created;
        second.spec.target_namespace = "b".to_string();
        let err = store.replace(&second).await.unwrap_err();
        assert!(matches!(err, kube::Error::Api(e) if e.code == 409));
    }

    #[tokio::test]
    async fn finalizers_block_deletion() {
        let store = FakeStore::<SharedResource>::new();
        let mut obj = generated("cluster-");
        obj.finalizers_mut().push("test".to_string());
        let created = store.create(&obj).await.unwrap();
        let name = created.name_any();
        store.delete(&name).await.unwrap();
        let terminating = store.find(&name).unwrap();
        assert!(terminating.meta().deletion_timestamp.is_some());

        let mut readded = terminating.clone();
        readded.finalizers_mut().push("other".to_string());
        let err = store.replace(&readded).await.unwrap_err();
        assert!(matches!(err, kube::Error::Api(e) if e.code == 422));

        let mut released = terminating.clone();
        released.finalizers_mut().clear();
        store.replace(&released).await.unwrap();
        assert!(store.find(&name).is_none());
    }
}
