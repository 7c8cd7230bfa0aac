use super::{build_builder_pod, encode_required_buildpacks, BuildArtifact, BuildParams};
use crate::fixtures;
use wharf_core::models::{Buildpack, SourceBlob};
use wharf_core::procfile::Procfile;

fn params(artifact: BuildArtifact) -> BuildParams {
    let mut procfile = Procfile::new();
    procfile.insert("web".into(), "python app.py".into());
    BuildParams {
        source: SourceBlob {
            path: "apps/demo/source.tgz".into(),
            sha256: "ab".repeat(32),
            url: "https://blobs.example.com/apps/demo/source.tgz?sig=x".into(),
        },
        branch: "main".into(),
        revision: "3f2a1c9".into(),
        procfile,
        extra_envs: [("BUILD_ENV".to_string(), "stag".to_string())].into_iter().collect(),
        builder_image: "builder:bionic".into(),
        buildpacks: vec![
            Buildpack::parse("tar", "python", "https://bp.example.com/python.tgz", "v213").expect("fixture buildpack must parse"),
            Buildpack::parse("git", "extra", "https://vcs.example.com/extra.git", "v1").expect("fixture buildpack must parse"),
        ],
        stream_channel_id: "c".repeat(32),
        artifact,
    }
}

#[test]
fn required_buildpacks_encoding_is_stable() {
    let params = params(BuildArtifact::Image { tag: "v1".into() });
    let encoded = encode_required_buildpacks(&params.buildpacks);
    assert_eq!(
        encoded,
        "tar python https://bp.example.com/python.tgz v213;git extra https://vcs.example.com/extra.git v1"
    );
}

#[test]
fn required_buildpacks_encoding_of_empty_list_is_empty() {
    assert_eq!(encode_required_buildpacks(&[]), "");
}

#[test]
fn builder_pod_carries_source_and_buildpack_envs() {
    let wl_app = fixtures::wl_app("demo_app");
    let params = params(BuildArtifact::Slug {
        path: "apps/demo/slug.tgz".into(),
        get_url: "https://blobs.example.com/apps/demo/slug.tgz?sig=y".into(),
    });
    let (config, _tmpdir) = crate::config::Config::new_test().expect("test config must build");

    let pod = build_builder_pod("slug-builder-demo0us0app", &wl_app, &params, &config);

    assert_eq!(pod.metadata.name.as_deref(), Some("slug-builder-demo0us0app"));
    assert_eq!(pod.metadata.namespace.as_deref(), Some(wl_app.namespace.as_str()));
    let spec = pod.spec.as_ref().expect("expected pod spec");
    assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
    let secrets = spec.image_pull_secrets.as_ref().expect("expected pull secrets");
    assert_eq!(secrets[0].name.as_deref(), Some(config.builder_pull_secret.as_str()));

    let container = &spec.containers[0];
    assert_eq!(container.image.as_deref(), Some("builder:bionic"));
    let env = container.env.as_ref().expect("expected env vars");
    let get = |name: &str| {
        env.iter()
            .find(|var| var.name == name)
            .and_then(|var| var.value.clone())
            .unwrap_or_else(|| panic!("expected env var {}", name))
    };
    assert_eq!(get("SOURCE_GET_URL"), params.source.url);
    assert_eq!(get("SOURCE_SHA256"), params.source.sha256);
    assert!(get("REQUIRED_BUILDPACKS").starts_with("tar python "));
    assert_eq!(get("SLUG_SET_PATH"), "apps/demo/slug.tgz");
    assert_eq!(get("BUILD_ENV"), "stag");
}

#[test]
fn builder_pod_for_image_output_carries_output_tag() {
    let wl_app = fixtures::wl_app("demo");
    let params = params(BuildArtifact::Image { tag: "demo:v4".into() });
    let (config, _tmpdir) = crate::config::Config::new_test().expect("test config must build");

    let pod = build_builder_pod("slug-builder-demo", &wl_app, &params, &config);

    let env = pod.spec.as_ref().and_then(|spec| spec.containers[0].env.clone()).expect("expected env vars");
    assert!(
        env.iter().any(|var| var.name == "OUTPUT_IMAGE" && var.value.as_deref() == Some("demo:v4")),
        "expected OUTPUT_IMAGE env var"
    );
}
