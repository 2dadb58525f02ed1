//! Client configuration file written by the server and read by the harness
//!
//! The layout follows the familiar kubeconfig shape: named clusters, named
//! users and named contexts tying the two together. Only the fields the
//! harness needs to reach the server are modelled.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{SharedError, SharedResult};

/// Context for the server's base (tenant-facing) endpoint
pub const BASE_CONTEXT: &str = "base";

/// Context for the root shard, authenticated as the system master
pub const SHARD_BASE_CONTEXT: &str = "shard-base";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClientConfig {
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub users: Vec<NamedAuthInfo>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedAuthInfo {
    pub name: String,
    pub user: AuthInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub cluster: String,
    pub user: String,
}

/// Everything a client needs to talk to one endpoint of the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTarget {
    pub server: String,
    pub token: Option<String>,
    pub certificate_authority: Option<PathBuf>,
    pub insecure_skip_tls_verify: bool,
    pub user_agent: Option<String>,
}

impl ClientTarget {
    /// Copy of this target that identifies itself with the given user agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Absolute URL for a path on this target's server
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.server.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

impl ClientConfig {
    /// Config with the two well-known contexts pointing at one server
    pub fn for_server(server: impl Into<String>, token: impl Into<String>) -> Self {
        let server = server.into();
        let token = token.into();
        Self {
            clusters: vec![
                NamedCluster {
                    name: BASE_CONTEXT.to_string(),
                    cluster: Cluster {
                        server: format!("{}/clusters/root", server.trim_end_matches('/')),
                        ..Cluster::default()
                    },
                },
                NamedCluster {
                    name: SHARD_BASE_CONTEXT.to_string(),
                    cluster: Cluster {
                        server,
                        ..Cluster::default()
                    },
                },
            ],
            users: vec![NamedAuthInfo {
                name: "admin".to_string(),
                user: AuthInfo { token: Some(token) },
            }],
            contexts: vec![
                NamedContext {
                    name: BASE_CONTEXT.to_string(),
                    context: Context {
                        cluster: BASE_CONTEXT.to_string(),
                        user: "admin".to_string(),
                    },
                },
                NamedContext {
                    name: SHARD_BASE_CONTEXT.to_string(),
                    context: Context {
                        cluster: SHARD_BASE_CONTEXT.to_string(),
                        user: "admin".to_string(),
                    },
                },
            ],
            current_context: Some(BASE_CONTEXT.to_string()),
        }
    }

    /// Parse a config from YAML; `path` is only used in error messages
    pub fn parse(path: &Path, contents: &str) -> SharedResult<Self> {
        serde_yaml::from_str(contents).map_err(|source| SharedError::ClientConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn read(path: &Path) -> SharedResult<Self> {
        let contents = fs::read_to_string(path).map_err(|source| SharedError::ClientConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &contents)
    }

    /// Write through a temporary sibling and rename, so readers polling the
    /// path never observe a partially written file.
    pub fn write_atomic(&self, path: &Path) -> SharedResult<()> {
        let contents = serde_yaml::to_string(self)?;
        let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
        let io_err = |source| SharedError::ClientConfigIo {
            path: path.to_path_buf(),
            source,
        };
        fs::write(&tmp, contents).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)
    }

    /// Resolve a named context into a connectable target
    pub fn target(&self, context: &str) -> SharedResult<ClientTarget> {
        let ctx = self
            .contexts
            .iter()
            .find(|c| c.name == context)
            .ok_or_else(|| SharedError::ContextNotFound {
                name: context.to_string(),
            })?;
        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == ctx.context.cluster)
            .ok_or_else(|| SharedError::ClusterNotFound {
                name: ctx.context.cluster.clone(),
                context: context.to_string(),
            })?;
        let user = self
            .users
            .iter()
            .find(|u| u.name == ctx.context.user)
            .ok_or_else(|| SharedError::UserNotFound {
                name: ctx.context.user.clone(),
                context: context.to_string(),
            })?;

        Ok(ClientTarget {
            server: cluster.cluster.server.clone(),
            token: user.user.token.clone(),
            certificate_authority: cluster.cluster.certificate_authority.clone(),
            insecure_skip_tls_verify: cluster.cluster.insecure_skip_tls_verify,
            user_agent: None,
        })
    }
}
