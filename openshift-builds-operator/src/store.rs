use async_trait::async_trait;
use kube::{
    Api, Resource, ResourceExt,
    api::{DeleteParams, ListParams, PostParams},
};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;

use crate::MANAGER;

/// The Kubernetes API operations the reconcilers need for objects of type `K`.
///
/// Writes are conditional: `replace` and `replace_status` carry the object's
/// `resourceVersion`, so a concurrent writer makes them fail with a conflict
/// instead of being silently overwritten.
#[async_trait]
pub(crate) trait ObjectStore<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    async fn list(&self) -> kube::Result<Vec<K>>;

    async fn get(&self, name: &str) -> kube::Result<K>;

    async fn create(&self, obj: &K) -> kube::Result<K>;

    /// Replace everything but the status sub-resource.
    async fn replace(&self, obj: &K) -> kube::Result<K>;

    /// Replace only the status sub-resource.
    async fn replace_status(&self, obj: &K) -> kube::Result<K>;

    async fn delete(&self, name: &str) -> kube::Result<()>;
}

fn post_params() -> PostParams {
    let mut pp = PostParams::default();
    pp.field_manager = Some(MANAGER.to_string());
    pp
}

#[async_trait]
impl<K> ObjectStore<K> for Api<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn list(&self) -> kube::Result<Vec<K>> {
        Ok(Api::list(self, &ListParams::default()).await?.items)
    }

    async fn get(&self, name: &str) -> kube::Result<K> {
        Api::get(self, name).await
    }

    async fn create(&self, obj: &K) -> kube::Result<K> {
        Api::create(self, &post_params(), obj).await
    }

    async fn replace(&self, obj: &K) -> kube::Result<K> {
        Api::replace(self, obj.name_any().as_str(), &post_params(), obj).await
    }

    async fn replace_status(&self, obj: &K) -> kube::Result<K> {
        let data = serde_json::to_vec(obj).map_err(kube::Error::SerdeError)?;
        Api::replace_status(self, obj.name_any().as_str(), &post_params(), data).await
    }

    async fn delete(&self, name: &str) -> kube::Result<()> {
        Api::delete(self, name, &DeleteParams::default())
            .await
            .map(|_| ())
    }
}
