use isecl_k8s_controller::crd::HostAttributes;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&HostAttributes::crd())?);
    Ok(())
}
