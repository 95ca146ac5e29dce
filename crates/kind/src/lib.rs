//! kubeguard kind: throwaway KinD clusters.
//!
//! [`Kind`] manages a pinned `kind` binary under its own directory and starts
//! clusters named `<name>-<node version>`, each with a kubeconfig file of its
//! own. [`Kind::start`] returns once the cluster's system pods are running.

#![forbid(unsafe_code)]

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kubeguard_config::{ClientConfigBuilder, ConfigEnv, ConfigError};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const DEFAULT_VERSION: &str = "v0.11.1";
pub const DEFAULT_DIR: &str = "./.kind";
/// Pods a fresh cluster runs once its control plane is up.
pub const MIN_READY_PODS: usize = 8;
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

const DOWNLOAD_BASE: &str = "https://kind.sigs.k8s.io/dl";

#[derive(Debug, thiserror::Error)]
pub enum KindError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("downloading kind: {0}")]
    Download(#[from] reqwest::Error),
    #[error("no kind release for {os}/{arch}")]
    UnsupportedPlatform { os: &'static str, arch: &'static str },
    #[error("`kind {args}` failed: {status}")]
    Command { args: String, status: ExitStatus },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("kube: {0}")]
    Kube(#[from] kube::Error),
}

pub type KindResult<T> = Result<T, KindError>;

/// A pinned `kind` installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kind {
    pub dir: PathBuf,
    pub version: String,
}

impl Default for Kind {
    fn default() -> Self {
        Self { dir: PathBuf::from(DEFAULT_DIR), version: DEFAULT_VERSION.to_string() }
    }
}

/// A cluster started by [`Kind::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindCluster {
    dir: PathBuf,
    name: String,
    node_version: String,
}

impl KindCluster {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_version(&self) -> &str {
        &self.node_version
    }

    pub fn id(&self) -> String {
        format!("{}-{}", self.name, self.node_version)
    }

    pub fn kubeconfig_path(&self) -> PathBuf {
        self.dir.join(".kube").join(format!("config-{}", self.id()))
    }
}

impl Kind {
    pub fn new(dir: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self { dir: dir.into(), version: version.into() }
    }

    pub fn binary_path(&self) -> PathBuf {
        self.dir.join("bin").join(format!("kind-{}", self.version))
    }

    /// Release URL of the binary for the host platform.
    pub fn download_url(&self) -> KindResult<String> {
        download_url(&self.version, std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Handle for a cluster of this installation; nothing is created.
    pub fn cluster(&self, name: &str, node_version: &str) -> KindCluster {
        KindCluster { dir: self.dir.clone(), name: name.to_string(), node_version: node_version.to_string() }
    }

    pub async fn list_clusters(&self) -> KindResult<Vec<String>> {
        let out = self.output(&["get", "clusters"]).await?;
        Ok(parse_cluster_list(&out))
    }

    /// False as well when the clusters cannot be listed.
    pub async fn exists(&self, id: &str) -> bool {
        match self.list_clusters().await {
            Ok(clusters) => clusters.iter().any(|c| c == id),
            Err(e) => {
                warn!(error = %e, "kind: listing clusters failed");
                false
            }
        }
    }

    /// Download the binary for the host platform.
    pub async fn install(&self) -> KindResult<()> {
        let url = self.download_url()?;
        let path = self.binary_path();
        info!(%url, path = %path.display(), "kind: installing");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let resp = reqwest::get(&url).await?.error_for_status()?;
        let mut file = tokio::fs::File::create(&path).await?;
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        make_executable(&path).await?;
        Ok(())
    }

    /// Kubeconfig of a running cluster, as printed by `kind get kubeconfig`.
    pub async fn kubeconfig(&self, id: &str) -> KindResult<String> {
        self.output(&["get", "kubeconfig", "--name", id]).await
    }

    /// Start `name` on `kindest/node:<node_version>`, reusing a running cluster
    /// of the same id, and wait until its system pods run.
    pub async fn start(&self, name: &str, node_version: &str) -> KindResult<KindCluster> {
        if !tokio::fs::try_exists(self.binary_path()).await.unwrap_or(false) {
            self.install().await?;
        }
        let cluster = self.cluster(name, node_version);
        let kubeconfig = cluster.kubeconfig_path();
        if !self.exists(&cluster.id()).await {
            if let Some(parent) = kubeconfig.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let image = format!("kindest/node:{node_version}");
            let id = cluster.id();
            let kubeconfig_arg = kubeconfig.to_string_lossy();
            let args = ["create", "cluster", "--image", image.as_str(), "--name", id.as_str(), "--kubeconfig", kubeconfig_arg.as_ref()];
            info!(cluster = %id, image = %image, "kind: creating cluster");
            if let Err(e) = self.run(&args).await {
                self.dump_logs(&id).await;
                return Err(e);
            }
        }
        if !tokio::fs::try_exists(&kubeconfig).await.unwrap_or(false) {
            let contents = self.kubeconfig(&cluster.id()).await?;
            tokio::fs::write(&kubeconfig, contents).await?;
        }
        self.wait_ready(&cluster).await?;
        info!(cluster = %cluster.id(), "kind: cluster ready");
        Ok(cluster)
    }

    /// Delete the cluster and its kubeconfig.
    pub async fn delete(&self, cluster: &KindCluster) -> KindResult<()> {
        let id = cluster.id();
        self.run(&["delete", "cluster", "--name", id.as_str()]).await?;
        tokio::fs::remove_file(cluster.kubeconfig_path()).await?;
        info!(cluster = %id, "kind: cluster deleted");
        Ok(())
    }

    async fn wait_ready(&self, cluster: &KindCluster) -> KindResult<()> {
        let config = ClientConfigBuilder::new(ConfigEnv::default()).kubeconfig_path(cluster.kubeconfig_path()).build().await?;
        let client = kube::Client::try_from(config)?;
        let pods: Api<Pod> = Api::all(client);
        loop {
            match pods.list(&ListParams::default()).await {
                Ok(list) if pods_ready(&list.items) => return Ok(()),
                Ok(list) => debug!(pods = list.items.len(), "kind: cluster is still initializing"),
                Err(e) => debug!(error = %e, "kind: api server not answering yet"),
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Export cluster logs and echo every file to stdout.
    async fn dump_logs(&self, id: &str) {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "kind: no temp dir for logs");
                return;
            }
        };
        let target = dir.path().to_string_lossy().into_owned();
        if let Err(e) = self.run(&["export", "logs", target.as_str(), "--name", id]).await {
            warn!(error = %e, "kind: exporting logs failed");
        }
        if let Err(e) = echo_files(dir.path()) {
            warn!(error = %e, "kind: echoing logs failed");
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(self.binary_path());
        cmd.args(args).stdin(Stdio::null());
        cmd
    }

    /// Run with inherited output.
    async fn run(&self, args: &[&str]) -> KindResult<()> {
        debug!(args = ?args, "kind: run");
        let status = self.command(args).stdout(Stdio::inherit()).stderr(Stdio::inherit()).status().await?;
        check(args, status)
    }

    /// Run and capture stdout.
    async fn output(&self, args: &[&str]) -> KindResult<String> {
        debug!(args = ?args, "kind: run");
        let out = self.command(args).stderr(Stdio::inherit()).output().await?;
        check(args, out.status)?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

fn check(args: &[&str], status: ExitStatus) -> KindResult<()> {
    if status.success() {
        Ok(())
    } else {
        Err(KindError::Command { args: args.join(" "), status })
    }
}

fn download_url(version: &str, os: &'static str, arch: &'static str) -> KindResult<String> {
    let os_name = match os {
        "linux" => "linux",
        "macos" => "darwin",
        "windows" => "windows",
        _ => return Err(KindError::UnsupportedPlatform { os, arch }),
    };
    let arch_name = match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        _ => return Err(KindError::UnsupportedPlatform { os, arch }),
    };
    Ok(format!("{DOWNLOAD_BASE}/{version}/kind-{os_name}-{arch_name}"))
}

fn parse_cluster_list(out: &str) -> Vec<String> {
    out.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect()
}

/// Enough pods exist and all of them are running.
pub fn pods_ready(pods: &[Pod]) -> bool {
    pods.len() >= MIN_READY_PODS
        && pods.iter().all(|p| p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running"))
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn echo_files(dir: &Path) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(next) = pending.pop() {
        for entry in std::fs::read_dir(&next)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            writeln!(stdout, "###### {}", path.display())?;
            io::copy(&mut std::fs::File::open(&path)?, &mut stdout)?;
        }
    }
    stdout.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;

    fn pod(phase: &str) -> Pod {
        Pod { status: Some(PodStatus { phase: Some(phase.into()), ..Default::default() }), ..Default::default() }
    }

    #[test]
    fn cluster_paths_follow_the_id() {
        let kind = Kind::default();
        let cluster = kind.cluster("kind-test", "v1.15.3");
        assert_eq!(cluster.id(), "kind-test-v1.15.3");
        assert_eq!(cluster.kubeconfig_path(), PathBuf::from("./.kind/.kube/config-kind-test-v1.15.3"));
        assert_eq!(kind.binary_path(), PathBuf::from("./.kind/bin/kind-v0.11.1"));
    }

    #[test]
    fn download_url_maps_platform_names() {
        assert_eq!(
            download_url("v0.11.1", "linux", "x86_64").unwrap(),
            "https://kind.sigs.k8s.io/dl/v0.11.1/kind-linux-amd64"
        );
        assert_eq!(
            download_url("v0.20.0", "macos", "aarch64").unwrap(),
            "https://kind.sigs.k8s.io/dl/v0.20.0/kind-darwin-arm64"
        );
        assert!(matches!(download_url("v0.11.1", "freebsd", "x86_64"), Err(KindError::UnsupportedPlatform { .. })));
    }

    #[test]
    fn cluster_list_ignores_blank_lines() {
        assert_eq!(parse_cluster_list("a-v1\n  b-v2 \n\n"), vec!["a-v1", "b-v2"]);
        assert!(parse_cluster_list("").is_empty());
    }

    #[test]
    fn readiness_needs_enough_running_pods() {
        let running: Vec<Pod> = (0..MIN_READY_PODS).map(|_| pod("Running")).collect();
        assert!(pods_ready(&running));
        assert!(!pods_ready(&running[1..]));
        let mut pending = running.clone();
        pending.push(pod("Pending"));
        assert!(!pods_ready(&pending));
    }

    #[test]
    fn echo_files_walks_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("node/logs")).unwrap();
        std::fs::write(dir.path().join("node/logs/kubelet.log"), "started\n").unwrap();
        echo_files(dir.path()).unwrap();
    }
}
