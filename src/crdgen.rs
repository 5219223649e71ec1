use kube::CustomResourceExt;

fn main() {
    let crd = kops_operator::api::kops_cluster::KopsCluster::crd();
    match serde_yaml::to_string(&crd) {
        Ok(doc) => print!("{doc}"),
        Err(err) => {
            eprintln!("failed to render CRD: {err}");
            std::process::exit(1);
        }
    }
}
