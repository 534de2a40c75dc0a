//! Tern kubehub: the Kubernetes API server as a list/watch authority.
//!
//! [`KubeListerWatcher`] adapts any typed kube [`kube::Api`] to
//! [`tern_core::ListerWatcher`]. The `PodNetwork` resource ships with ready-made
//! informer and lister constructors.

#![forbid(unsafe_code)]

mod informers;
mod podnetwork;
mod watch;

pub use informers::{
    new_filtered_pod_network_informer, new_pod_network_informer, pod_network_informer_with_config,
    PodNetworkInformer, PodNetworkLister,
};
pub use podnetwork::{PodNetwork, PodNetworkSpec, PodNetworkStatus, CONDITION_ACCEPTED, CONDITION_READY};
pub use watch::{authority_error, convert_event, KubeListerWatcher, TweakListOptions};
