use super::AppDescription;

const DOC_V1: &str = r#"
spec_version: 1
app_code: legacy-app
language: python
processes:
  web: "python manage.py runserver"
  Worker:
    command: "celery -A app worker"
    replicas: 2
"#;

const DOC_V2: &str = r#"
spec_version: 2
app:
  bk_app_code: demo
  bk_app_name: Demo
modules:
  default:
    is_default: true
    language: python
    env_variables:
      - key: FOO
        value: bar
    svc_discovery:
      bk_saas:
        - other-app
processes:
  - name: Web
    command: "python manage.py runserver"
    replicas: 1
    plan: "Starter"
"#;

const DOC_V3: &str = r#"
spec_version: 3
app:
  bk_app_code: cnative-demo
modules:
  - name: default
    is_default: true
    language: python
    spec:
      processes:
        - name: web
          command: ["python"]
          args: ["main.py"]
          replicas: 2
          targetPort: 5000
          resQuotaPlan: "4C2G"
          autoscaling:
            minReplicas: 1
            maxReplicas: 5
      configuration:
        env:
          - name: FOO
            value: bar
      envOverlay:
        replicas:
          - envName: stag
            process: web
            count: 1
        resQuotas:
          - envName: prod
            process: web
            plan: "4C4G"
"#;

#[test]
fn load_v1_builds_a_single_default_module() {
    let desc = AppDescription::load(DOC_V1).expect("expected v1 doc to load");
    assert_eq!(desc.spec_version, 1);
    assert_eq!(desc.modules.len(), 1);
    let module = desc.default_module().expect("expected a default module");
    assert_eq!(module.name, "default");
    assert_eq!(module.processes.len(), 2);
    assert!(
        module.processes.iter().any(|process| process.name == "worker" && process.replicas == Some(2)),
        "expected Worker to be normalized to worker, got {:?}",
        module.processes
    );
}

#[test]
fn load_v2_normalizes_names_and_attaches_top_level_processes() {
    let desc = AppDescription::load(DOC_V2).expect("expected v2 doc to load");
    assert_eq!(desc.app.bk_app_code, "demo");
    let module = desc.default_module().expect("expected a default module");
    assert_eq!(module.env_variables.get("FOO").map(String::as_str), Some("bar"));
    assert_eq!(module.svc_discovery, vec!["other-app".to_string()]);
    let web = &module.processes[0];
    assert_eq!(web.name, "web", "expected top-level process name to be lowercased");
    assert_eq!(web.plan.as_deref(), Some("Starter"));
}

#[test]
fn load_v3_carries_env_overlay_and_structured_commands() {
    let desc = AppDescription::load(DOC_V3).expect("expected v3 doc to load");
    let module = desc.default_module().expect("expected a default module");
    let web = &module.processes[0];
    assert_eq!(web.command_parts, vec!["python".to_string()]);
    assert_eq!(web.args, vec!["main.py".to_string()]);
    assert_eq!(web.port, Some(5000));
    assert!(web.autoscaling, "expected autoscaling flag to be derived from the autoscaling block");
    let scaling = web.scaling_config.as_ref().expect("expected scaling config");
    assert_eq!((scaling.min_replicas, scaling.max_replicas), (1, 5));
    let overlay = module.env_overlay.as_ref().expect("expected env overlay");
    assert_eq!(overlay.replicas.len(), 1);
    assert_eq!(overlay.res_quotas.len(), 1);
}

#[test]
fn load_rejects_unknown_versions() {
    let res = AppDescription::load("spec_version: 9\napp_code: x\n");
    assert!(res.is_err(), "expected unsupported spec_version to be rejected, got {:?}", res.map(|d| d.spec_version));
}

#[test]
fn load_rejects_invalid_process_names() {
    let doc = r#"
spec_version: 1
app_code: x
processes:
  "bad_name": "run"
"#;
    assert!(AppDescription::load(doc).is_err(), "expected invalid process name to be rejected");
}

#[test]
fn load_rejects_duplicate_default_modules() {
    let doc = r#"
spec_version: 3
app:
  bk_app_code: x
modules:
  - name: a
    is_default: true
    spec: { processes: [] }
  - name: b
    is_default: true
    spec: { processes: [] }
"#;
    assert!(AppDescription::load(doc).is_err(), "expected duplicate default modules to be rejected");
}
