//! Fixed sanitization rule tables.
//!
//! Kind-specific rules are a lookup from kind name to an ordered list of
//! strip paths; adding a kind means adding a row, not touching the
//! traversal in [`super::path`].

/// Server-assigned metadata fields removed from every record.
pub const METADATA_FIELDS: &[&str] = &[
    "uid",
    "selfLink",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "managedFields",
];

/// Annotation keys that change without any change to desired state.
pub const EPHEMERAL_ANNOTATIONS: &[&str] = &[
    "kubectl.kubernetes.io/last-applied-configuration",
    "deployment.kubernetes.io/revision",
];

/// Label keys rotated by controllers on every rollout.
pub const EPHEMERAL_LABELS: &[&str] = &["pod-template-hash"];

/// Cluster-assigned spec fields, per kind.
pub const KIND_RULES: &[(&str, &[&str])] = &[
    (
        "Service",
        &["spec.clusterIP", "spec.clusterIPs", "spec.ports[].nodePort"],
    ),
    ("PersistentVolumeClaim", &["spec.volumeName", "spec.volumeMode"]),
    ("PersistentVolume", &["spec.claimRef"]),
];

/// Default declarative strip list, applied to every record after the
/// built-in passes.
pub const DEFAULT_STRIP_PATHS: &[&str] = &[
    "metadata.uid",
    "metadata.selfLink",
    "metadata.resourceVersion",
    "metadata.generation",
    "metadata.creationTimestamp",
    "metadata.annotations[kubectl.kubernetes.io/last-applied-configuration]",
    "metadata.annotations[deployment.kubernetes.io/revision]",
    "status",
    "spec.clusterIP",
    "spec.clusterIPs",
    "spec.ports[].nodePort",
];

pub fn default_strip_paths() -> Vec<String> {
    DEFAULT_STRIP_PATHS.iter().map(|s| s.to_string()).collect()
}
