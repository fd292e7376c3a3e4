//! Member pod manifests and pod comparison

mod compare;
mod manifest;

pub use compare::{compare_pods, is_pod_ready, is_terminating, PodComparison};
pub use manifest::{
    build_member_config_map, build_member_pod, build_member_pvcs, config_map_name,
    group_selector, identity_labels, pvc_name, CLIENT_TLS_MOUNT_PATH, CONFIG_FILE_NAME,
    CONFIG_MOUNT_PATH, TLS_MOUNT_PATH,
};
