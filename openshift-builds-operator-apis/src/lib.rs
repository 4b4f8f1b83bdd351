use std::fmt;

use k8s_openapi::chrono::{SecondsFormat, Utc};
use kube::CustomResource;

use schemars::{
    JsonSchema,
    r#gen::SchemaGenerator,
    schema::{InstanceType, Schema, SchemaObject},
};
use serde::{Deserialize, Serialize};

/// Name of the `CustomResourceDefinition` backing [`OpenShiftBuild`].
pub const OPENSHIFT_BUILD_CRD_NAME: &'static str = "openshiftbuilds.operator.openshift.io";

/// Name of the one and only meaningful [`OpenShiftBuild`] object.
pub const OPENSHIFT_BUILD_RESOURCE_NAME: &'static str = "cluster";

/// Default namespace the managed components are deployed to.
pub const OPENSHIFT_BUILD_NAMESPACE_NAME: &'static str = "openshift-builds";

/// Condition type signalling overall convergence.
pub const CONDITION_READY: &'static str = "Ready";

/// We maintain our own copy of Condition as the one from k8s_openapi does not implement JsonSchema.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
    /// lastTransitionTime is the last time the condition transitioned from one status to another. This should be when the underlying condition changed.  If that is not known, then using the time when the API field changed is acceptable.
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// message is a human readable message indicating details about the transition. This may be an empty string.
    pub message: String,

    /// observedGeneration represents the .metadata.generation that the condition was set based upon. For instance, if .metadata.generation is currently 12, but the .status.conditions\[x\].observedGeneration is 9, the condition is out of date with respect to the current state of the instance.
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// reason contains a programmatic identifier indicating the reason for the condition's last transition. Producers of specific condition types may define expected values and meanings for this field, and whether the values are considered a guaranteed API. The value should be a CamelCase string. This field may not be empty.
    pub reason: String,

    /// status of the condition, one of True, False, Unknown.
    pub status: String,

    /// type of condition in CamelCase or in foo.example.com/CamelCase.
    #[serde(rename = "type")]
    pub type_: String,
}

impl Condition {
    pub fn new(tpe: &str, status: Option<bool>, reason: &str, message: String) -> Self {
        Self {
            last_transition_time: None,
            message,
            reason: reason.to_string(),
            status: status
                .map(|v| if v { "True" } else { "False" })
                .unwrap_or("Unknown")
                .to_string(),
            type_: tpe.to_string(),
            observed_generation: None,
        }
    }
}

/// Set `condition` in `conditions`, keeping at most one entry per type.
///
/// An existing entry of the same type is updated in place and its
/// `lastTransitionTime` only moves when the status value changes.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    let now = || Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status != condition.status {
                existing.status = condition.status;
                existing.last_transition_time =
                    condition.last_transition_time.or_else(|| Some(now()));
            }
            existing.reason = condition.reason;
            existing.message = condition.message;
            existing.observed_generation = condition.observed_generation;
        }
        None => {
            if condition.last_transition_time.is_none() {
                condition.last_transition_time = Some(now());
            }
            conditions.push(condition);
        }
    }
}

/// Desired state of a managed component.
///
/// Values other than `Enabled` and `Disabled` are kept verbatim in
/// [`State::Unknown`] so that the controller can report them instead of
/// silently rewriting them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum State {
    /// Install the component.
    #[default]
    Enabled,
    /// Remove the component.
    Disabled,
    Unknown(String),
}

impl From<String> for State {
    fn from(v: String) -> Self {
        match v.as_str() {
            "Enabled" => State::Enabled,
            "Disabled" => State::Disabled,
            _ => State::Unknown(v),
        }
    }
}

impl From<State> for String {
    fn from(v: State) -> Self {
        v.to_string()
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Enabled => f.write_str("Enabled"),
            State::Disabled => f.write_str("Disabled"),
            State::Unknown(v) => f.write_str(v),
        }
    }
}

impl JsonSchema for State {
    fn schema_name() -> String {
        "State".to_string()
    }

    fn json_schema(_: &mut SchemaGenerator) -> Schema {
        SchemaObject {
            instance_type: Some(InstanceType::String.into()),
            enum_values: Some(vec!["Enabled".into(), "Disabled".into()]),
            ..Default::default()
        }
        .into()
    }
}

/// Desired state of a single managed component.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct Component {
    /// Whether the component is installed (`Enabled`) or removed (`Disabled`).
    pub state: State,
}

impl Component {
    pub fn enabled() -> Self {
        Self {
            state: State::Enabled,
        }
    }
}

/// Desired state of the Shipwright components.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct Shipwright {
    /// Desired state of the Shipwright Build component.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<Component>,
}

/// Desired state of the OpenShift Builds installation on a cluster.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.openshift.io",
    version = "v1alpha1",
    kind = "OpenShiftBuild",
    plural = "openshiftbuilds",
    derive = "PartialEq",
    status = "OpenShiftBuildStatus",
    printcolumn = r#"{
        "name":"Ready",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status",
        "description": "Whether all managed components are reconciled."
    }"#
)]
pub struct OpenShiftBuildSpec {
    /// Shipwright components, defaults to an enabled Shipwright Build.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipwright: Option<Shipwright>,
    /// Shared Resources CSI driver, enabled by default.
    #[serde(rename = "sharedResource", skip_serializing_if = "Option::is_none")]
    pub shared_resource: Option<Component>,
}

impl OpenShiftBuildSpec {
    /// Desired state of the Shipwright Build component, `Enabled` if unset.
    pub fn shipwright_build_state(&self) -> State {
        self.shipwright
            .as_ref()
            .and_then(|s| s.build.as_ref())
            .map(|b| b.state.clone())
            .unwrap_or_default()
    }

    /// Desired state of the Shared Resources component, `Enabled` if unset.
    pub fn shared_resource_state(&self) -> State {
        self.shared_resource
            .as_ref()
            .map(|s| s.state.clone())
            .unwrap_or_default()
    }

    /// Fill in every unset component with its default. Values already present
    /// are left untouched. Returns `true` if anything was added.
    pub fn apply_defaults(&mut self) -> bool {
        let mut changed = false;
        let shipwright = self.shipwright.get_or_insert_with(|| {
            changed = true;
            Shipwright::default()
        });
        if shipwright.build.is_none() {
            shipwright.build = Some(Component::enabled());
            changed = true;
        }
        if self.shared_resource.is_none() {
            self.shared_resource = Some(Component::enabled());
            changed = true;
        }
        changed
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct OpenShiftBuildStatus {
    /// Latest available observations of the installation's state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl OpenShiftBuildStatus {
    pub fn update_condition(&mut self, c: Condition) {
        let conditions = self.conditions.get_or_insert_with(Vec::new);
        set_condition(conditions, c);
    }

    pub fn condition(&self, tpe: &str) -> Option<&Condition> {
        self.conditions
            .as_ref()
            .and_then(|v| v.iter().find(|c| c.type_ == tpe))
    }

    /// `true` if the `Ready` condition is `True`.
    pub fn is_ready(&self) -> bool {
        self.condition(CONDITION_READY)
            .map_or(false, |c| c.status == "True")
    }
}

impl OpenShiftBuild {
    pub fn id(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    pub fn versioned_id(&self) -> String {
        format!(
            "{}@{}",
            self.id(),
            self.metadata.resource_version.as_deref().unwrap_or("")
        )
    }

    pub fn update_condition(&mut self, c: Condition) {
        self.status
            .get_or_insert_with(OpenShiftBuildStatus::default)
            .update_condition(c);
    }

    pub fn has_conditions(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map_or(false, |c| !c.is_empty())
    }

    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map_or(false, |s| s.is_ready())
    }
}

/// Deployment of the Shared Resources CSI driver.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.openshift.io",
    version = "v1alpha1",
    kind = "SharedResource",
    plural = "sharedresources",
    derive = "PartialEq",
    status = "SharedResourceStatus"
)]
pub struct SharedResourceSpec {
    /// Namespace the Shared Resources CSI driver is deployed to.
    #[serde(rename = "targetNamespace", default, skip_serializing_if = "String::is_empty")]
    pub target_namespace: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct SharedResourceStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl SharedResourceStatus {
    pub fn is_ready(&self) -> bool {
        self.conditions.iter().flatten().any(|c| {
            c.type_ == CONDITION_READY && c.status == "True"
        })
    }
}

/// Installation of Shipwright Build, owned by the Shipwright operator.
///
/// Only the fields this operator sets are modelled.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.shipwright.io",
    version = "v1alpha1",
    kind = "ShipwrightBuild",
    plural = "shipwrightbuilds",
    derive = "PartialEq",
    status = "ShipwrightBuildStatus"
)]
pub struct ShipwrightBuildSpec {
    /// Namespace Shipwright Build is deployed to.
    #[serde(rename = "targetNamespace", default, skip_serializing_if = "String::is_empty")]
    pub target_namespace: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct ShipwrightBuildStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}
