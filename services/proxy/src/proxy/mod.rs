//! Data-plane collaborators: where sessions come from and go to.

pub mod cluster;
pub mod listener;

pub use cluster::{build as build_cluster, ClusterKind, ClusterSpec, EchoCluster, TcpCluster};
pub use listener::{Listener, ListenerConfig, ListenerSpec, ListenerStats, RuleListBinding};
