//! The kind-sort policy (C3): a total order over documents by
//! (priority-of-kind, namespace, name), stable so ties preserve encounter
//! order.

use crate::document::Document;

fn priority(api_version: &str, kind: &str) -> i32 {
    match (api_version, kind) {
        ("v1", "Node") => -99,
        ("admissionregistration.k8s.io/v1", "MutatingWebhookConfiguration") => -96,
        ("admissionregistration.k8s.io/v1", "ValidatingWebhookConfiguration") => -95,
        ("apiextensions.k8s.io/v1", "CustomResourceDefinition") => -94,
        ("v1", "Namespace") => -92,
        ("v1", "ServiceAccount") => -91,
        ("rbac.authorization.k8s.io/v1", "ClusterRole") => -90,
        ("rbac.authorization.k8s.io/v1", "Role") => -89,
        ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding") => -88,
        ("rbac.authorization.k8s.io/v1", "RoleBinding") => -87,
        ("v1", "ConfigMap") => -10,
        ("v1", "Secret") => -9,
        ("apps/v1", "Deployment") => -8,
        ("v1", "Service") => -7,
        _ => 0,
    }
}

/// sort_key is the `(priority, namespace, name)` tuple compared by
/// [`sort_documents`].
fn sort_key(doc: &Document) -> (i32, String, String) {
    (priority(&doc.api_version(), &doc.kind()), doc.namespace(), doc.name())
}

/// sort_documents applies the kind-sort policy in place. Uses a stable sort
/// so ties on all three keys preserve the slice's original order.
pub fn sort_documents(documents: &mut [Document]) {
    documents.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(api_version: &str, kind: &str, namespace: &str, name: &str) -> Document {
        Document::new(
            serde_yaml::from_str(&format!(
                "apiVersion: {api_version}\nkind: {kind}\nmetadata:\n  namespace: {namespace}\n  name: {name}\n"
            ))
            .unwrap(),
        )
    }

    #[test]
    fn service_sorts_before_deployment() {
        let mut docs = vec![
            doc("apps/v1", "Deployment", "ns", "d1"),
            doc("v1", "Service", "ns", "s1"),
        ];
        sort_documents(&mut docs);
        assert_eq!(docs[0].kind(), "Service");
        assert_eq!(docs[1].kind(), "Deployment");
    }

    #[test]
    fn namespace_then_name_break_ties_within_same_kind() {
        let mut docs = vec![
            doc("v1", "ConfigMap", "z", "a"),
            doc("v1", "ConfigMap", "a", "b"),
            doc("v1", "ConfigMap", "a", "a"),
        ];
        sort_documents(&mut docs);
        let names: Vec<_> = docs.iter().map(|d| (d.namespace(), d.name())).collect();
        assert_eq!(
            names,
            vec![
                ("a".to_owned(), "a".to_owned()),
                ("a".to_owned(), "b".to_owned()),
                ("z".to_owned(), "a".to_owned())
            ]
        );
    }

    #[test]
    fn unknown_kinds_keep_encounter_order() {
        let mut docs = vec![
            doc("example.com/v1", "Widget", "ns", "w2"),
            doc("example.com/v1", "Widget", "ns", "w2"),
        ];
        let before: Vec<_> = docs.iter().map(Document::name).collect();
        sort_documents(&mut docs);
        let after: Vec<_> = docs.iter().map(Document::name).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn node_sorts_first_overall() {
        let mut docs = vec![
            doc("v1", "Namespace", "", "ns"),
            doc("v1", "Node", "", "node-1"),
        ];
        sort_documents(&mut docs);
        assert_eq!(docs[0].kind(), "Node");
    }
}
