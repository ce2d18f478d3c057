//! Include/exclude policy over resource kinds and namespaces.
//!
//! Exclusion always wins over inclusion. An empty include list means "all".
//! List entries may be glob patterns (`kube-*`); entries without wildcards
//! are plain membership checks. Kind names compare case-insensitively.

use tracing::debug;

use crate::config::SelectionConfig;
use crate::models::ResourceRecord;

/// Decide whether a record with this kind and namespace is backed up.
///
/// Cluster-scoped records (empty namespace) always pass namespace filtering.
pub fn include(
    kind: &str,
    namespace: &str,
    include_kinds: &[String],
    exclude_kinds: &[String],
    include_namespaces: &[String],
    exclude_namespaces: &[String],
) -> bool {
    if !passes(kind, include_kinds, exclude_kinds, true) {
        return false;
    }
    if namespace.is_empty() {
        return true;
    }
    passes(namespace, include_namespaces, exclude_namespaces, false)
}

fn passes(value: &str, include: &[String], exclude: &[String], fold_case: bool) -> bool {
    if exclude.iter().any(|p| matches_entry(value, p, fold_case)) {
        return false;
    }
    include.is_empty() || include.iter().any(|p| matches_entry(value, p, fold_case))
}

fn matches_entry(value: &str, entry: &str, fold_case: bool) -> bool {
    if fold_case {
        let value = value.to_ascii_lowercase();
        let entry = entry.to_ascii_lowercase();
        matches_pattern(&value, &entry)
    } else {
        matches_pattern(value, entry)
    }
}

fn matches_pattern(value: &str, pattern: &str) -> bool {
    if pattern.contains(['*', '?', '[', '{']) {
        glob_match::glob_match(pattern, value)
    } else {
        value == pattern
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Selection lists bound together, plus the system-object filter.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    include_kinds: Vec<String>,
    exclude_kinds: Vec<String>,
    include_namespaces: Vec<String>,
    exclude_namespaces: Vec<String>,
    skip_system_objects: bool,
}

impl Selection {
    pub fn new(config: &SelectionConfig) -> Self {
        Self {
            include_kinds: config.include_kinds.clone(),
            exclude_kinds: config.exclude_kinds.clone(),
            include_namespaces: config.include_namespaces.clone(),
            exclude_namespaces: config.exclude_namespaces.clone(),
            skip_system_objects: config.skip_system_objects,
        }
    }

    /// Select everything, system objects included. Used by embedders that
    /// filter upstream, such as a source that already lists exactly what to
    /// back up.
    pub fn all() -> Self {
        Self::default()
    }

    /// Apply kind/namespace policy and, when enabled, drop cluster-managed
    /// objects.
    pub fn accepts(&self, record: &ResourceRecord) -> bool {
        let id = &record.id;
        if !include(
            &id.kind,
            &id.namespace,
            &self.include_kinds,
            &self.exclude_kinds,
            &self.include_namespaces,
            &self.exclude_namespaces,
        ) {
            return false;
        }
        if self.skip_system_objects && is_system_object(record) {
            debug!(resource = %id, "skipping system-managed object");
            return false;
        }
        true
    }

    /// Filter a batch, keeping source order.
    pub fn filter(&self, records: Vec<ResourceRecord>) -> Vec<ResourceRecord> {
        records.into_iter().filter(|r| self.accepts(r)).collect()
    }
}

/// Secret types populated by the cluster or by release tooling.
const SYSTEM_SECRET_TYPES: &[&str] = &["kubernetes.io/service-account-token", "helm.sh/release.v1"];

/// ConfigMaps injected into every namespace by the control plane.
const SYSTEM_CONFIGMAPS: &[&str] = &["kube-root-ca.crt"];

/// Built-in aggregate ClusterRoles.
const DEFAULT_CLUSTER_ROLES: &[&str] = &["admin", "edit", "view"];

/// Name prefixes of RBAC objects owned by the control plane or cluster addons.
const SYSTEM_RBAC_PREFIXES: &[&str] = &[
    "system:",
    "kubernetes-",
    "k8s-",
    "cilium",
    "coredns",
    "kube-dns",
    "metrics-server",
];

fn has_system_rbac_prefix(name: &str) -> bool {
    SYSTEM_RBAC_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Objects the cluster recreates on its own.
pub fn is_system_object(record: &ResourceRecord) -> bool {
    let name = record.id.name.as_str();
    match record.id.kind.as_str() {
        "ConfigMap" => SYSTEM_CONFIGMAPS.contains(&name),
        "ServiceAccount" => name == "default",
        "ClusterRole" => DEFAULT_CLUSTER_ROLES.contains(&name) || has_system_rbac_prefix(name),
        "ClusterRoleBinding" => has_system_rbac_prefix(name),
        "Secret" => record
            .object
            .get("type")
            .and_then(|t| t.as_str())
            .is_some_and(|t| SYSTEM_SECRET_TYPES.contains(&t)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceId;
    use serde_json::json;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exclude_kind_wins_over_include() {
        let inc = list(&["Pod", "Service"]);
        let exc = list(&["Pod"]);
        assert!(!include("Pod", "app", &inc, &exc, &[], &[]));
        assert!(include("Service", "app", &inc, &exc, &[], &[]));
    }

    #[test]
    fn test_exclusion_holds_for_any_include_list() {
        let exc = list(&["Event"]);
        for inc in [list(&[]), list(&["Event"]), list(&["Event", "Service"])] {
            for ns in ["", "default", "prod"] {
                assert!(!include("Event", ns, &inc, &exc, &[], &[]));
            }
        }
    }

    #[test]
    fn test_empty_include_means_all() {
        assert!(include("Anything", "ns", &[], &[], &[], &[]));
        assert!(include("", "", &[], &[], &[], &[]));
    }

    #[test]
    fn test_kind_not_in_include_rejected() {
        let inc = list(&["Deployment"]);
        assert!(!include("Service", "ns", &inc, &[], &[], &[]));
    }

    #[test]
    fn test_kind_match_is_case_insensitive() {
        let inc = list(&["deployment"]);
        assert!(include("Deployment", "ns", &inc, &[], &[], &[]));
        let exc = list(&["SECRET"]);
        assert!(!include("Secret", "ns", &[], &exc, &[], &[]));
    }

    #[test]
    fn test_namespace_filtering() {
        let exc = list(&["kube-system", "kube-node-lease"]);
        assert!(!include("Service", "kube-system", &[], &[], &[], &exc));
        assert!(include("Service", "my-app", &[], &[], &[], &exc));

        let inc = list(&["production", "staging"]);
        assert!(include("Service", "production", &[], &[], &inc, &[]));
        assert!(!include("Service", "development", &[], &[], &inc, &[]));

        let inc = list(&["production", "kube-system"]);
        let exc = list(&["kube-system"]);
        assert!(!include("Service", "kube-system", &[], &[], &inc, &exc));
    }

    #[test]
    fn test_cluster_scoped_ignores_namespace_lists() {
        let inc = list(&["production"]);
        let exc = list(&["*"]);
        assert!(include("ClusterRole", "", &[], &[], &inc, &exc));
    }

    #[test]
    fn test_glob_entries() {
        let exc = list(&["kube-*"]);
        assert!(!include("Service", "kube-public", &[], &[], &[], &exc));
        assert!(include("Service", "cube-public", &[], &[], &[], &exc));

        let inc = list(&["*Binding"]);
        assert!(include("RoleBinding", "ns", &inc, &[], &[], &[]));
        assert!(!include("Role", "ns", &inc, &[], &[], &[]));
    }

    #[test]
    fn test_system_objects() {
        let root_ca = ResourceRecord::new(
            ResourceId::new("v1", "ConfigMap", "app", "kube-root-ca.crt"),
            json!({"data": {}}),
        );
        let sa_token = ResourceRecord::new(
            ResourceId::new("v1", "Secret", "app", "default-token-x"),
            json!({"type": "kubernetes.io/service-account-token"}),
        );
        let opaque = ResourceRecord::new(
            ResourceId::new("v1", "Secret", "app", "db"),
            json!({"type": "Opaque"}),
        );
        assert!(is_system_object(&root_ca));
        assert!(is_system_object(&sa_token));
        assert!(!is_system_object(&opaque));

        let selection = Selection {
            skip_system_objects: true,
            ..Selection::default()
        };
        let kept = selection.filter(vec![root_ca.clone(), sa_token, opaque.clone()]);
        assert_eq!(kept, vec![opaque]);

        assert!(Selection::all().accepts(&root_ca));
    }

    fn named(api_version: &str, kind: &str, ns: &str, name: &str) -> ResourceRecord {
        ResourceRecord::new(ResourceId::new(api_version, kind, ns, name), json!({}))
    }

    #[test]
    fn test_default_service_account_is_system() {
        assert!(is_system_object(&named("v1", "ServiceAccount", "app", "default")));
        assert!(!is_system_object(&named("v1", "ServiceAccount", "app", "deployer")));
    }

    #[test]
    fn test_default_cluster_roles_are_system() {
        let rbac = "rbac.authorization.k8s.io/v1";
        for name in ["admin", "edit", "view"] {
            assert!(is_system_object(&named(rbac, "ClusterRole", "", name)), "{name}");
        }
        assert!(!is_system_object(&named(rbac, "ClusterRole", "", "app-reader")));
        // Only the ClusterRoles are built in, a binding named "admin" is user-made.
        assert!(!is_system_object(&named(rbac, "ClusterRoleBinding", "", "admin")));
    }

    #[test]
    fn test_system_rbac_prefixes() {
        let rbac = "rbac.authorization.k8s.io/v1";
        for name in [
            "system:controller:deployment-controller",
            "kubernetes-dashboard",
            "k8s-metrics",
            "cilium-operator",
            "coredns",
            "kube-dns-autoscaler",
            "metrics-server:system:auth-delegator",
        ] {
            assert!(is_system_object(&named(rbac, "ClusterRole", "", name)), "{name}");
            assert!(is_system_object(&named(rbac, "ClusterRoleBinding", "", name)), "{name}");
        }
        assert!(!is_system_object(&named(rbac, "ClusterRoleBinding", "", "ops-admins")));
        // Prefix rules are for cluster-wide RBAC only.
        assert!(!is_system_object(&named(rbac, "Role", "app", "system:leader-locking")));
    }
}
