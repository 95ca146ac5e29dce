//! kubeguard config: kubeconfig path resolution and the client configuration builder.
//!
//! Process environment is read once into a [`ConfigEnv`]; everything below it
//! works on that value.

#![forbid(unsafe_code)]

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use kube::config::{InClusterError, KubeConfigOptions, Kubeconfig, KubeconfigError};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("kubeconfig: {0}")]
    Kubeconfig(#[from] KubeconfigError),
    #[error("invalid server url {url:?}: {source}")]
    InvalidServerUrl {
        url: String,
        #[source]
        source: http::uri::InvalidUri,
    },
    #[error("impersonating groups requires a user to impersonate")]
    ImpersonateGroupsWithoutUser,
    #[error("no kubeconfig found and not running in a cluster: {0}")]
    NoConfiguration(#[source] InClusterError),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Environment inputs of kubeconfig resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigEnv {
    /// Value of `KUBECONFIG`, possibly a list of paths.
    pub kubeconfig: Option<OsString>,
    /// Value of `HOME`.
    pub home: Option<PathBuf>,
}

impl ConfigEnv {
    pub fn from_process() -> Self {
        Self { kubeconfig: std::env::var_os("KUBECONFIG"), home: std::env::var_os("HOME").map(PathBuf::from) }
    }

    fn candidates(&self, explicit: Option<&Path>) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = explicit.filter(|p| !p.as_os_str().is_empty()).map(Path::to_path_buf).into_iter().collect();
        if let Some(list) = &self.kubeconfig {
            out.extend(std::env::split_paths(list).filter(|p| !p.as_os_str().is_empty()));
        }
        if let Some(home) = &self.home {
            out.push(home.join(".kube").join("config"));
        }
        out
    }
}

/// First existing kubeconfig among the explicit path, each `KUBECONFIG`
/// entry and `$HOME/.kube/config`.
pub fn kubeconfig_path(explicit: Option<&Path>, env: &ConfigEnv) -> Option<PathBuf> {
    env.candidates(explicit).into_iter().find(|p| p.exists()).map(|p| clean(&p))
}

fn clean(path: &Path) -> PathBuf {
    path.components().filter(|c| !matches!(c, Component::CurDir)).collect()
}

/// Assembles a [`kube::Config`] from a kubeconfig plus overrides.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    env: ConfigEnv,
    kubeconfig_path: Option<PathBuf>,
    context: Option<String>,
    server_url: Option<String>,
    default_server_url: Option<String>,
    impersonate_user: Option<String>,
    impersonate_groups: Vec<String>,
    token_file: Option<String>,
}

impl ClientConfigBuilder {
    pub fn new(env: ConfigEnv) -> Self {
        Self { env, ..Default::default() }
    }

    /// Kubeconfig to load; when missing the environment defaults apply.
    pub fn kubeconfig_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig_path = Some(path.into());
        self
    }

    /// Equivalent to `kubectl --context`.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Force the API server URL regardless of the kubeconfig.
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }

    /// Server URL used when no kubeconfig exists and no override is set.
    pub fn default_server_url(mut self, url: impl Into<String>) -> Self {
        self.default_server_url = Some(url.into());
        self
    }

    /// Equivalent to `kubectl --as`.
    pub fn impersonate_user(mut self, user: impl Into<String>) -> Self {
        self.impersonate_user = Some(user.into());
        self
    }

    /// Equivalent to `kubectl --as-group`, repeated.
    pub fn impersonate_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.impersonate_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Token file name, looked up next to the kubeconfig when it has no credentials.
    pub fn token_file(mut self, name: impl Into<String>) -> Self {
        self.token_file = Some(name.into());
        self
    }

    pub async fn build(self) -> ConfigResult<kube::Config> {
        if !self.impersonate_groups.is_empty() && self.impersonate_user.is_none() {
            return Err(ConfigError::ImpersonateGroupsWithoutUser);
        }
        let resolved = kubeconfig_path(self.kubeconfig_path.as_deref(), &self.env);
        let server = self.server_url.clone().or_else(|| match resolved {
            None => self.default_server_url.clone(),
            Some(_) => None,
        });

        let mut config = match (&resolved, &server) {
            (Some(path), _) => {
                debug!(path = %path.display(), context = ?self.context, "loading kubeconfig");
                let kubeconfig = Kubeconfig::read_from(path)?;
                let opts = KubeConfigOptions { context: self.context.clone(), ..Default::default() };
                kube::Config::from_custom_kubeconfig(kubeconfig, &opts).await?
            }
            (None, Some(url)) => kube::Config::new(parse_url(url)?),
            (None, None) => kube::Config::incluster().map_err(ConfigError::NoConfiguration)?,
        };
        if let Some(url) = &server {
            config.cluster_url = parse_url(url)?;
        }
        if let Some(user) = self.impersonate_user {
            config.auth_info.impersonate = Some(user);
        }
        if !self.impersonate_groups.is_empty() {
            config.auth_info.impersonate_groups = Some(self.impersonate_groups);
        }
        if let (Some(name), Some(path)) = (self.token_file.as_deref(), resolved.as_deref()) {
            discover_token(&mut config, path, name);
        }
        info!(server = %config.cluster_url, "client config ready");
        Ok(config)
    }
}

fn parse_url(url: &str) -> ConfigResult<http::Uri> {
    url.parse().map_err(|source| ConfigError::InvalidServerUrl { url: url.to_string(), source })
}

fn has_credentials(auth: &kube::config::AuthInfo) -> bool {
    auth.token.is_some()
        || auth.token_file.is_some()
        || auth.client_key.is_some()
        || auth.client_key_data.is_some()
        || auth.exec.is_some()
}

/// Point the config at a bearer token file next to the kubeconfig.
fn discover_token(config: &mut kube::Config, kubeconfig: &Path, name: &str) {
    if has_credentials(&config.auth_info) || name.is_empty() {
        return;
    }
    let candidate = kubeconfig.parent().unwrap_or_else(|| Path::new("")).join(name);
    if candidate.is_file() {
        debug!(path = %candidate.display(), "using discovered token file");
        config.auth_info.token_file = Some(candidate.to_string_lossy().into_owned());
    }
}
