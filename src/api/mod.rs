pub mod cluster;
pub mod kops_cluster;
