use daemonjob_operator::crd::DaemonJob;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    println!("---");
    println!("# DaemonJob CRD");
    println!("{}", serde_yaml::to_string(&DaemonJob::crd())?);
    Ok(())
}
