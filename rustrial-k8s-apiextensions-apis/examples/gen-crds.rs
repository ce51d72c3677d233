use kube::CustomResourceExt;
use rustrial_k8s_apiextensions_apis::CustomResourceDefinition;

pub fn main() -> Result<(), serde_yaml::Error> {
    println!("{}", serde_yaml::to_string(&CustomResourceDefinition::crd())?);
    Ok(())
}
