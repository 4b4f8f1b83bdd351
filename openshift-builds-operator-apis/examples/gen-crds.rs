use kube::CustomResourceExt;
use openshift_builds_operator_apis::{OpenShiftBuild, SharedResource};
use serde_yaml;

pub fn main() {
    println!("{}", serde_yaml::to_string(&OpenShiftBuild::crd()).unwrap());
    println!("---");
    println!("{}", serde_yaml::to_string(&SharedResource::crd()).unwrap());
}
