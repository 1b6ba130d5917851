//! Update-skipping equality for pods
//!
//! After creation only a handful of pod fields may change: container and
//! init-container images, `activeDeadlineSeconds`, tolerations, labels and
//! annotations. Everything else is immutable, so comparing it would only
//! cause needless provider updates.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Pod};

fn images(containers: Option<&Vec<Container>>) -> Vec<Option<&str>> {
    containers
        .map(|cs| cs.iter().map(|c| c.image.as_deref()).collect())
        .unwrap_or_default()
}

fn non_empty(map: Option<&BTreeMap<String, String>>) -> Option<&BTreeMap<String, String>> {
    map.filter(|m| !m.is_empty())
}

/// Returns true if `a` and `b` agree on every field mutable after creation.
///
/// Absent and empty label or annotation maps are equal. A different number of
/// containers is a difference.
pub fn pods_equal(a: &Pod, b: &Pod) -> bool {
    let (sa, sb) = (a.spec.as_ref(), b.spec.as_ref());

    let containers = images(sa.map(|s| &s.containers)) == images(sb.map(|s| &s.containers));
    let init_containers = images(sa.and_then(|s| s.init_containers.as_ref()))
        == images(sb.and_then(|s| s.init_containers.as_ref()));
    let deadline = sa.and_then(|s| s.active_deadline_seconds)
        == sb.and_then(|s| s.active_deadline_seconds);
    let tolerations = sa.and_then(|s| s.tolerations.as_ref()) == sb.and_then(|s| s.tolerations.as_ref());
    let labels =
        non_empty(a.metadata.labels.as_ref()) == non_empty(b.metadata.labels.as_ref());
    let annotations = non_empty(a.metadata.annotations.as_ref())
        == non_empty(b.metadata.annotations.as_ref());

    containers && init_containers && deadline && tolerations && labels && annotations
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, Toleration};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(images: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: images
                    .iter()
                    .enumerate()
                    .map(|(i, image)| Container {
                        name: format!("c{i}"),
                        image: Some(image.to_string()),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pod_equals_itself() {
        let p = pod(&["nginx:1.25", "envoy:1.30"]);
        assert!(pods_equal(&p, &p));
    }

    /// Story: the provider returns a pod with `labels: {}` where we had none
    ///
    /// Semantically empty maps must not trigger an update.
    #[test]
    fn story_empty_and_absent_maps_are_equal() {
        let a = pod(&["nginx:1.25"]);
        let mut b = a.clone();
        b.metadata.labels = Some(BTreeMap::new());
        b.metadata.annotations = Some(BTreeMap::new());
        assert!(pods_equal(&a, &b));
        assert!(pods_equal(&b, &a));
    }

    #[test]
    fn image_change_is_a_difference() {
        assert!(!pods_equal(&pod(&["nginx:1.25"]), &pod(&["nginx:1.26"])));

        let a = pod(&["nginx:1.25"]);
        let mut b = a.clone();
        if let Some(spec) = b.spec.as_mut() {
            spec.init_containers = Some(vec![Container {
                name: "init".to_string(),
                image: Some("busybox".to_string()),
                ..Default::default()
            }]);
        }
        assert!(!pods_equal(&a, &b));
    }

    #[test]
    fn container_count_change_is_a_difference() {
        assert!(!pods_equal(&pod(&["nginx"]), &pod(&["nginx", "envoy"])));
        assert!(!pods_equal(&pod(&["nginx", "envoy"]), &pod(&["nginx"])));
    }

    #[test]
    fn mutable_fields_are_compared() {
        let a = pod(&["nginx"]);

        let mut deadline = a.clone();
        deadline.spec.as_mut().unwrap().active_deadline_seconds = Some(30);
        assert!(!pods_equal(&a, &deadline));

        let mut tolerations = a.clone();
        tolerations.spec.as_mut().unwrap().tolerations = Some(vec![Toleration {
            key: Some("virtual-node".to_string()),
            operator: Some("Exists".to_string()),
            ..Default::default()
        }]);
        assert!(!pods_equal(&a, &tolerations));

        let mut labels = a.clone();
        labels.metadata.labels = Some(BTreeMap::from([("app".to_string(), "web".to_string())]));
        assert!(!pods_equal(&a, &labels));
    }

    #[test]
    fn immutable_fields_are_ignored() {
        let a = pod(&["nginx"]);
        let mut b = a.clone();
        let spec = b.spec.as_mut().unwrap();
        spec.restart_policy = Some("Never".to_string());
        spec.node_name = Some("other-node".to_string());
        spec.containers[0].command = Some(vec!["sleep".to_string()]);
        b.metadata.resource_version = Some("99".to_string());
        assert!(pods_equal(&a, &b));
    }
}
