use base64::{Engine as _, engine::general_purpose::STANDARD};
use flate2::{Compression, read::MultiGzDecoder, write::GzEncoder};
use http::Uri;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use thiserror::Error;

/// Cluster entry of a join token whose server URL points at the control plane.
pub static CLUSTER_NAME: &str = "k0s";

#[derive(Error, Debug)]
pub enum Error {
    #[error("DecodeError: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("DecodeError: {0}")]
    Compression(#[source] std::io::Error),

    #[error("ParseError: {0}")]
    Document(#[from] serde_yaml::Error),

    #[error("ParseError: cluster `{0}` not found")]
    MissingCluster(String),

    #[error("ParseError: invalid server url `{0}`")]
    InvalidServer(String),

    #[error("ParseError: user `{0}` not found")]
    MissingUser(String),

    #[error("ParseError: user `{0}` has no token id")]
    EmptyTokenId(String),

    #[error("ConfigurationError: unknown role `{0}`")]
    UnsupportedRole(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Role a join token grants to the joining node.
///
/// Unknown values are kept as `Unsupported` so that they surface as a
/// configuration error instead of failing deserialization.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Controller,
    #[default]
    Worker,
    Unsupported(String),
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        match value.as_str() {
            "controller" => Role::Controller,
            "worker" => Role::Worker,
            _ => Role::Unsupported(value),
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Controller => f.write_str("controller"),
            Role::Worker => f.write_str("worker"),
            Role::Unsupported(other) => f.write_str(other),
        }
    }
}

impl Role {
    /// Name of the kubeconfig user carrying the bootstrap token for this role.
    pub fn bootstrap_user(&self) -> Result<&'static str> {
        match self {
            Role::Controller => Ok("controller-bootstrap"),
            Role::Worker => Ok("kubelet-bootstrap"),
            Role::Unsupported(other) => Err(Error::UnsupportedRole(other.clone())),
        }
    }
}

/// Client configuration embedded in a join token.
///
/// Only the fields the controller touches are typed, everything else is
/// carried through `extra` so re-serialization does not lose data.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(rename = "apiVersion", default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(rename = "current-context", default, skip_serializing_if = "Option::is_none")]
    pub current_context: Option<String>,
    #[serde(default)]
    pub users: Vec<NamedUser>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterEntry,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterEntry {
    #[serde(default)]
    pub server: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextEntry,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub user: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: UserEntry,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// base64 -> gunzip
///
/// Concatenated gzip members are all decoded, trailing bytes that are not
/// another member are an error.
pub fn decode(token: &str) -> Result<Vec<u8>> {
    let compressed = STANDARD.decode(token)?;
    let mut output = Vec::new();
    MultiGzDecoder::new(compressed.as_slice())
        .read_to_end(&mut output)
        .map_err(Error::Compression)?;
    Ok(output)
}

/// gzip (best compression) -> base64
pub fn encode(data: &[u8]) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data).map_err(Error::Compression)?;
    let compressed = encoder.finish().map_err(Error::Compression)?;
    Ok(STANDARD.encode(compressed))
}

/// Point the `k0s` cluster entry of a client config at `port`.
///
/// Scheme, host and path of the server URL are left as they are.
pub fn rewrite_port(document: &[u8], port: u16) -> Result<(Vec<u8>, ClientConfig)> {
    let mut config: ClientConfig = serde_yaml::from_slice(document)?;

    let cluster = config
        .clusters
        .iter_mut()
        .find(|c| c.name == CLUSTER_NAME)
        .ok_or_else(|| Error::MissingCluster(CLUSTER_NAME.to_string()))?;
    cluster.cluster.server = with_port(&cluster.cluster.server, port)?;

    let output = serde_yaml::to_string(&config)?;
    Ok((output.into_bytes(), config))
}

fn with_port(server: &str, port: u16) -> Result<String> {
    let invalid = || Error::InvalidServer(server.to_string());

    let uri: Uri = server.parse().map_err(|_| invalid())?;
    let authority = uri.authority().ok_or_else(invalid)?;

    // Splice the new authority into the original string, Uri's Display
    // would otherwise normalize an empty path to "/".
    let start = server.find("://").ok_or_else(invalid)? + 3;
    let end = start + authority.as_str().len();
    let userinfo = authority
        .as_str()
        .rsplit_once('@')
        .map(|(userinfo, _)| format!("{userinfo}@"))
        .unwrap_or_default();

    Ok(format!(
        "{}{}{}:{}{}",
        &server[..start],
        userinfo,
        authority.host(),
        port,
        &server[end..]
    ))
}

/// Public part of the bootstrap token, the secret part after the first `.` is dropped.
pub fn extract_token_id(config: &ClientConfig, role: &Role) -> Result<String> {
    let user_name = role.bootstrap_user()?;
    let user = config
        .users
        .iter()
        .find(|u| u.name == user_name)
        .ok_or_else(|| Error::MissingUser(user_name.to_string()))?;

    let token = user.user.token.as_deref().unwrap_or_default();
    let id = token.split_once('.').map_or(token, |(id, _)| id);
    if id.is_empty() {
        return Err(Error::EmptyTokenId(user_name.to_string()));
    }
    Ok(id.to_string())
}

/// decode -> rewrite_port -> encode
///
/// The parsed config is handed back so callers can extract the token id
/// without parsing the document again.
pub fn replace_token_port(token: &str, port: u16) -> Result<(String, ClientConfig)> {
    let document = decode(token)?;
    let (document, config) = rewrite_port(&document, port)?;
    Ok((encode(&document)?, config))
}
