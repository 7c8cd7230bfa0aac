use k8s_openapi::api::apps::v1::{Deployment as K8sDeployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::core::v1::{Container, ContainerState, ContainerStateWaiting, ContainerStatus, Pod, PodCondition, PodSpec, PodStatus};
use kube::Resource;

use super::{attach_instances, instance_from_pod, max_resource_version, process_from_deployment};
use crate::fixtures;
use crate::utils;
use wharf_core::models::{AppType, Environment};

fn managed_deployment(env: &wharf_core::models::ModuleEnvironment, process_type: &str, replicas: u32, available: u32, rv: &str) -> K8sDeployment {
    let mut workload = K8sDeployment::default();
    workload.meta_mut().name = Some(crate::release::legacy::deployment_name(env, process_type));
    workload.meta_mut().resource_version = Some(rv.to_string());
    let labels = workload.meta_mut().labels.get_or_insert_with(Default::default);
    utils::set_canonical_labels(labels, &env.engine_app);
    labels.insert(utils::LABEL_PROCESS_TYPE.into(), process_type.to_string());
    workload.spec = Some(DeploymentSpec {
        replicas: Some(replicas as i32),
        ..Default::default()
    });
    workload.status = Some(DeploymentStatus {
        replicas: Some(replicas as i32),
        available_replicas: Some(available as i32),
        unavailable_replicas: Some((replicas - available) as i32),
        ..Default::default()
    });
    workload
}

fn managed_pod(env: &wharf_core::models::ModuleEnvironment, name: &str, process_type: &str, ready: bool, rv: &str) -> Pod {
    let mut pod = Pod::default();
    pod.meta_mut().name = Some(name.to_string());
    pod.meta_mut().resource_version = Some(rv.to_string());
    let labels = pod.meta_mut().labels.get_or_insert_with(Default::default);
    utils::set_canonical_labels(labels, &env.engine_app);
    labels.insert(utils::LABEL_PROCESS_TYPE.into(), process_type.to_string());
    labels.insert(utils::LABEL_RELEASE_VERSION.into(), "4".into());
    pod.spec = Some(PodSpec {
        containers: vec![Container {
            name: "main".into(),
            image: Some("registry.example.com/apps/demo:v4".into()),
            ..Default::default()
        }],
        ..Default::default()
    });
    pod.status = Some(PodStatus {
        host_ip: Some("10.0.0.7".into()),
        phase: Some("Running".into()),
        conditions: Some(vec![PodCondition {
            type_: "Ready".into(),
            status: if ready { "True".into() } else { "False".into() },
            ..Default::default()
        }]),
        container_statuses: Some(vec![ContainerStatus {
            name: "main".into(),
            restart_count: 2,
            state: Some(ContainerState {
                waiting: if ready {
                    None
                } else {
                    Some(ContainerStateWaiting {
                        reason: Some("CrashLoopBackOff".into()),
                        ..Default::default()
                    })
                },
                running: if ready { Some(Default::default()) } else { None },
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    });
    pod
}

#[test]
fn process_view_consolidates_deployment_status() {
    let env = fixtures::module_environment("demo", Environment::Stag, AppType::Default);
    let workload = managed_deployment(&env, "web", 3, 2, "100");

    let process = process_from_deployment(&env, &workload).expect("expected a process view");
    assert_eq!(process.process_type, "web");
    assert_eq!(process.replicas, 3);
    assert_eq!(process.status.success, 2);
    assert_eq!(process.status.failed, 1);
}

#[test]
fn process_type_falls_back_to_the_name_suffix() {
    let env = fixtures::module_environment("demo", Environment::Stag, AppType::Default);
    let mut workload = managed_deployment(&env, "worker", 1, 1, "5");
    workload
        .meta_mut()
        .labels
        .as_mut()
        .expect("expected labels")
        .remove(utils::LABEL_PROCESS_TYPE);

    let process = process_from_deployment(&env, &workload).expect("expected a process view");
    assert_eq!(process.process_type, "worker", "expected the type to be extracted from the deployment name");
}

#[test]
fn instance_view_reads_pod_details() {
    let env = fixtures::module_environment("demo", Environment::Stag, AppType::Default);
    let pod = managed_pod(&env, "web-abc123", "web", true, "7");

    let instance = instance_from_pod(&pod);
    assert_eq!(instance.name, "web-abc123");
    assert_eq!(instance.process_type.as_deref(), Some("web"));
    assert_eq!(instance.host_ip.as_deref(), Some("10.0.0.7"));
    assert_eq!(instance.state, "Running");
    assert!(instance.ready);
    assert_eq!(instance.restart_count, 2);
    assert_eq!(instance.image.as_deref(), Some("registry.example.com/apps/demo:v4"));
    assert_eq!(instance.version.as_deref(), Some("4"));
}

#[test]
fn instance_view_surfaces_waiting_reasons() {
    let env = fixtures::module_environment("demo", Environment::Stag, AppType::Default);
    let pod = managed_pod(&env, "web-abc123", "web", false, "7");

    let instance = instance_from_pod(&pod);
    assert_eq!(instance.state, "Waiting");
    assert_eq!(instance.state_message.as_deref(), Some("CrashLoopBackOff"));
    assert!(!instance.ready);
}

#[test]
fn instances_attach_to_their_process() {
    let env = fixtures::module_environment("demo", Environment::Stag, AppType::Default);
    let mut processes = vec![
        process_from_deployment(&env, &managed_deployment(&env, "web", 2, 2, "1")).expect("expected process"),
        process_from_deployment(&env, &managed_deployment(&env, "worker", 1, 1, "2")).expect("expected process"),
    ];
    let instances = vec![
        instance_from_pod(&managed_pod(&env, "web-1", "web", true, "3")),
        instance_from_pod(&managed_pod(&env, "web-2", "web", true, "4")),
        instance_from_pod(&managed_pod(&env, "worker-1", "worker", true, "5")),
    ];

    attach_instances(&mut processes, instances);

    assert_eq!(processes[0].instances.len(), 2);
    assert_eq!(processes[1].instances.len(), 1);
    assert_eq!(processes[1].instances[0].name, "worker-1");
}

#[test]
fn resource_version_watermark_is_the_max_seen() {
    let rv = max_resource_version(String::new(), Some(&"10".to_string()));
    let rv = max_resource_version(rv, Some(&"9".to_string()));
    let rv = max_resource_version(rv, Some(&"100".to_string()));
    assert_eq!(rv, "100");
}
