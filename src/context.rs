// Copyright 2025 Smart Scheduler Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::types;
use crate::types::v1alpha1::policy::{PodPlacementPolicy, PodPlacementPolicyStatus};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, ObjectList, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use snafu::Snafu;
use snafu::futures::TryFutureExt as _;
use std::fmt::Debug;
use tracing::info;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Kubernetes API error: {}", source))]
    Kube { source: kube::Error },

    #[snafu(display("record event error: {}", source))]
    Record { source: kube::Error },

    #[snafu(transparent)]
    Types { source: types::error::Error },

    #[snafu(transparent)]
    Serde { source: serde_json::Error },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(response) } if response.code == 404
        )
    }
}

/// Shared client facade for the controllers and the webhook.
pub struct Context {
    pub(crate) client: kube::Client,
}

impl Context {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    pub async fn get_opt<T>(&self, name: &str, namespace: &str) -> Result<Option<T>, Error>
    where
        T: Clone + DeserializeOwned + Debug + Resource<Scope = NamespaceResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).context(KubeSnafu).await
    }

    pub async fn list<T>(&self, namespace: &str, params: &ListParams) -> Result<ObjectList<T>, Error>
    where
        T: Clone + DeserializeOwned + Debug + Resource<Scope = NamespaceResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(self.client.clone(), namespace);
        api.list(params).context(KubeSnafu).await
    }

    pub async fn delete<T>(&self, name: &str, namespace: &str) -> Result<(), Error>
    where
        T: Clone + DeserializeOwned + Debug + Resource<Scope = NamespaceResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .context(KubeSnafu)
            .await?;
        Ok(())
    }

    /// Merge-patch a namespaced object. A `null` value removes the key.
    pub async fn merge_patch<T>(
        &self,
        name: &str,
        namespace: &str,
        patch: &serde_json::Value,
    ) -> Result<T, Error>
    where
        T: Clone + DeserializeOwned + Debug + Resource<Scope = NamespaceResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .context(KubeSnafu)
            .await
    }

    pub async fn update_policy_status(
        &self,
        policy: &PodPlacementPolicy,
        status: PodPlacementPolicyStatus,
    ) -> Result<PodPlacementPolicy, Error> {
        let api: Api<PodPlacementPolicy> =
            Api::namespaced(self.client.clone(), &policy.namespace()?);
        let name = policy.name_any();

        let mut updated = policy.clone();
        updated.status = Some(status.clone());
        let body = serde_json::to_vec(&updated)?;

        if let Ok(written) = api
            .replace_status(&name, &PostParams::default(), body)
            .context(KubeSnafu)
            .await
        {
            return Ok(written);
        }

        info!("status update failed due to conflict, retrieve the latest resource and retry.");

        let latest = api.get(&name).context(KubeSnafu).await?;
        let mut updated = latest.clone();
        updated.status = Some(status);
        let body = serde_json::to_vec(&updated)?;

        api.replace_status(&name, &PostParams::default(), body)
            .context(KubeSnafu)
            .await
    }
}
