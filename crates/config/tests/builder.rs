#![forbid(unsafe_code)]

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use kubeguard_config::{kubeconfig_path, ClientConfigBuilder, ConfigEnv, ConfigError};

const KUBECONFIG: &str = "\
apiVersion: v1
kind: Config
clusters:
- name: test
  cluster:
    server: https://127.0.0.1:6443
contexts:
- name: test
  context:
    cluster: test
    user: test
- name: other
  context:
    cluster: test
    user: test
    namespace: other-ns
current-context: test
users:
- name: test
  user: {}
";

fn write_kubeconfig(dir: &Path) -> PathBuf {
    let path = dir.join(".kube").join("config");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, KUBECONFIG).unwrap();
    path
}

fn no_env() -> ConfigEnv {
    ConfigEnv { kubeconfig: None, home: Some(PathBuf::from("./no-home")) }
}

#[test]
fn kubeconfig_path_precedence() {
    let home = tempfile::tempdir().unwrap();
    let in_home = write_kubeconfig(home.path());
    let other = tempfile::tempdir().unwrap();
    let in_other = write_kubeconfig(other.path());

    assert_eq!(kubeconfig_path(None, &no_env()), None);

    let env = ConfigEnv { kubeconfig: None, home: Some(home.path().to_path_buf()) };
    assert_eq!(kubeconfig_path(None, &env), Some(in_home.clone()));

    let listed = std::env::join_paths([PathBuf::from("/does/not/exist"), in_other.clone()]).unwrap();
    let env = ConfigEnv { kubeconfig: Some(listed), home: Some(home.path().to_path_buf()) };
    assert_eq!(kubeconfig_path(None, &env), Some(in_other.clone()));

    // an explicit path wins, a missing one falls through
    assert_eq!(kubeconfig_path(Some(in_home.as_path()), &env), Some(in_home.clone()));
    assert_eq!(kubeconfig_path(Some(Path::new("/does/not/exist")), &env), Some(in_other));
    let env = ConfigEnv { kubeconfig: Some(OsString::from("")), home: None };
    assert_eq!(kubeconfig_path(Some(Path::new("/does/not/exist")), &env), None);
}

#[tokio::test]
async fn builds_from_kubeconfig_with_impersonation() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_kubeconfig(dir.path());
    let config = ClientConfigBuilder::new(no_env())
        .kubeconfig_path(&path)
        .impersonate_user("test-user")
        .impersonate_groups(["test-group", "test-group-2"])
        .build()
        .await
        .unwrap();
    assert_eq!(config.cluster_url.host(), Some("127.0.0.1"));
    assert_eq!(config.cluster_url.port_u16(), Some(6443));
    assert_eq!(config.auth_info.impersonate.as_deref(), Some("test-user"));
    assert_eq!(config.auth_info.impersonate_groups, Some(vec!["test-group".to_string(), "test-group-2".to_string()]));
}

#[tokio::test]
async fn groups_without_user_are_rejected() {
    let e = ClientConfigBuilder::new(no_env()).impersonate_groups(["g"]).build().await.unwrap_err();
    assert!(matches!(e, ConfigError::ImpersonateGroupsWithoutUser), "{e}");
}

#[tokio::test]
async fn context_selects_namespace() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_kubeconfig(dir.path());
    let config = ClientConfigBuilder::new(no_env()).kubeconfig_path(&path).context("other").build().await.unwrap();
    assert_eq!(config.default_namespace, "other-ns");
}

#[tokio::test]
async fn server_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_kubeconfig(dir.path());

    let forced = ClientConfigBuilder::new(no_env())
        .kubeconfig_path(&path)
        .server_url("https://forced.example:443")
        .default_server_url("https://fallback.example")
        .build()
        .await
        .unwrap();
    assert_eq!(forced.cluster_url.host(), Some("forced.example"));

    // the default is ignored while a kubeconfig resolves
    let with_file = ClientConfigBuilder::new(no_env())
        .kubeconfig_path(&path)
        .default_server_url("https://fallback.example")
        .build()
        .await
        .unwrap();
    assert_eq!(with_file.cluster_url.host(), Some("127.0.0.1"));

    let fallback = ClientConfigBuilder::new(no_env()).default_server_url("https://fallback.example").build().await.unwrap();
    assert_eq!(fallback.cluster_url.host(), Some("fallback.example"));

    let e = ClientConfigBuilder::new(no_env()).server_url("not a url").build().await.unwrap_err();
    assert!(matches!(e, ConfigError::InvalidServerUrl { .. }), "{e}");
}

#[tokio::test]
async fn token_file_next_to_kubeconfig_is_discovered() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_kubeconfig(dir.path());
    let token = path.parent().unwrap().join("token");
    fs::write(&token, "secret-token").unwrap();

    let config = ClientConfigBuilder::new(no_env()).kubeconfig_path(&path).token_file("token").build().await.unwrap();
    assert_eq!(config.auth_info.token_file.as_deref(), Some(&*token.to_string_lossy()));

    let missing = ClientConfigBuilder::new(no_env()).kubeconfig_path(&path).token_file("absent").build().await.unwrap();
    assert!(missing.auth_info.token_file.is_none());
}
