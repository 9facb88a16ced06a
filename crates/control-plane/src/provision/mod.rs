//! Provisioner capabilities and the registry that maps names to backends.
//!
//! Every backend implements [`Provisioner`]. Backends that manage their own
//! hosts also expose [`NodeProvisioner`] through
//! [`Provisioner::as_node_provisioner`]; callers that need node operations on a
//! backend without them get a `not_supported` error.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use common::api::{DeployKind, NodeStatus, NodeView};

use crate::error::{ApiResult, AppError};
use crate::persistence::AppRecord;
use crate::streaming::StreamWriter;

pub mod local;

pub use local::LocalProvisioner;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone)]
pub struct DeployArgs {
    pub app: AppRecord,
    pub kind: DeployKind,
    /// Tag the produced image must carry.
    pub target_image: String,
    pub source_image: Option<String>,
    pub archive_url: Option<String>,
    pub commit: Option<String>,
    pub file: Option<Bytes>,
    pub build_only: bool,
}

#[derive(Debug, Clone)]
pub struct RollbackArgs {
    pub app: AppRecord,
    /// Full image reference or short `vN` tag, as sent by the caller.
    pub requested_image: String,
    /// Images eligible for rollback, newest first.
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub id: String,
    pub app: String,
    pub node_address: String,
    pub ip: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub address: String,
    pub pool: String,
    pub status: NodeStatus,
    pub metadata: BTreeMap<String, String>,
}

impl Node {
    pub fn to_view(&self, provisioner: &str) -> NodeView {
        NodeView {
            address: self.address.clone(),
            pool: self.pool.clone(),
            provisioner: provisioner.to_string(),
            status: match self.status {
                NodeStatus::Ready => "ready".to_string(),
                NodeStatus::Disabled => "disabled".to_string(),
            },
            metadata: self.metadata.clone(),
        }
    }

    /// `iaas-id` metadata, the key of the backing machine.
    pub fn iaas_id(&self) -> Option<&str> {
        self.metadata
            .get(metadata_keys::IAAS_ID)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }
}

/// Reserved node metadata keys.
pub mod metadata_keys {
    pub const IAAS: &str = "iaas";
    pub const IAAS_ID: &str = "iaas-id";
    pub const TEMPLATE: &str = "template";
    pub const POOL: &str = "pool";
    pub const ADDRESS: &str = "address";
}

#[derive(Debug, Clone)]
pub struct AddNodeOptions {
    pub address: String,
    pub pool: String,
    pub metadata: BTreeMap<String, String>,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UpdateNodeOptions {
    pub address: String,
    pub pool: Option<String>,
    /// Empty values remove the key.
    pub metadata: BTreeMap<String, String>,
    pub enable: bool,
    pub disable: bool,
}

#[derive(Debug, Clone)]
pub struct RemoveNodeOptions {
    pub address: String,
    pub rebalance: bool,
}

pub trait Provisioner: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn provision<'a>(&'a self, app: &'a AppRecord) -> BoxFuture<'a, crate::Result<()>>;

    fn destroy<'a>(&'a self, app: &'a AppRecord) -> BoxFuture<'a, crate::Result<()>>;

    /// Build and roll out. Returns the image now serving the app.
    fn deploy<'a>(&'a self, args: DeployArgs, out: StreamWriter)
    -> BoxFuture<'a, crate::Result<String>>;

    /// Roll back to an earlier image, resolved with [`resolve_rollback_image`].
    fn rollback<'a>(
        &'a self,
        args: RollbackArgs,
        out: StreamWriter,
    ) -> BoxFuture<'a, crate::Result<String>>;

    fn units<'a>(&'a self, app: &'a AppRecord) -> BoxFuture<'a, crate::Result<Vec<Unit>>>;

    fn add_units<'a>(&'a self, app: &'a AppRecord, count: u32)
    -> BoxFuture<'a, crate::Result<Vec<Unit>>>;

    fn remove_units<'a>(&'a self, app: &'a AppRecord, count: u32)
    -> BoxFuture<'a, crate::Result<()>>;

    fn as_node_provisioner(&self) -> Option<&dyn NodeProvisioner> {
        None
    }
}

pub trait NodeProvisioner: Send + Sync {
    fn list_nodes(&self) -> BoxFuture<'_, crate::Result<Vec<Node>>>;

    fn get_node<'a>(&'a self, address: &'a str) -> BoxFuture<'a, crate::Result<Option<Node>>>;

    fn add_node(&self, opts: AddNodeOptions) -> BoxFuture<'_, crate::Result<()>>;

    fn remove_node(&self, opts: RemoveNodeOptions) -> BoxFuture<'_, crate::Result<()>>;

    fn update_node(&self, opts: UpdateNodeOptions) -> BoxFuture<'_, crate::Result<()>>;
}

/// Provisioners by name, filled at startup and read-only afterwards.
#[derive(Clone)]
pub struct ProvisionerRegistry {
    provisioners: Arc<BTreeMap<String, Arc<dyn Provisioner>>>,
    default_name: String,
}

impl ProvisionerRegistry {
    pub fn new(default_name: impl Into<String>, provisioners: Vec<Arc<dyn Provisioner>>) -> Self {
        let provisioners = provisioners
            .into_iter()
            .map(|provisioner| (provisioner.name().to_string(), provisioner))
            .collect();
        Self {
            provisioners: Arc::new(provisioners),
            default_name: default_name.into(),
        }
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    pub fn names(&self) -> Vec<String> {
        self.provisioners.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> ApiResult<Arc<dyn Provisioner>> {
        self.provisioners
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("unknown provisioner: \"{name}\"")))
    }

    /// Provisioner for a pool, the configured default when the pool names none.
    pub fn for_pool_provisioner(&self, pool_provisioner: &str) -> ApiResult<Arc<dyn Provisioner>> {
        if pool_provisioner.is_empty() {
            self.get(&self.default_name)
        } else {
            self.get(pool_provisioner)
        }
    }

    pub fn node_provisioners(&self) -> Vec<Arc<dyn Provisioner>> {
        self.provisioners
            .values()
            .filter(|provisioner| provisioner.as_node_provisioner().is_some())
            .cloned()
            .collect()
    }

    /// Ask each node provisioner in turn for `address`.
    pub async fn find_node(&self, address: &str) -> ApiResult<Option<(Arc<dyn Provisioner>, Node)>> {
        for provisioner in self.node_provisioners() {
            let Some(nodes) = provisioner.as_node_provisioner() else {
                continue;
            };
            if let Some(node) = nodes.get_node(address).await? {
                return Ok(Some((provisioner.clone(), node)));
            }
        }
        Ok(None)
    }
}

pub fn node_capability(provisioner: &dyn Provisioner) -> ApiResult<&dyn NodeProvisioner> {
    provisioner.as_node_provisioner().ok_or_else(|| {
        AppError::not_supported(format!(
            "provisioner \"{}\" does not support node operations",
            provisioner.name()
        ))
    })
}

/// Resolve a rollback request against the app's rollback-eligible images.
///
/// A short `vN` tag picks the newest candidate ending in `:vN`.
pub fn resolve_rollback_image(requested: &str, candidates: &[String]) -> Result<String, String> {
    let requested = requested.trim();
    if requested.is_empty() {
        return Err("you must provide an image to roll back to".to_string());
    }

    let is_short_tag = requested
        .strip_prefix('v')
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
    let found = if is_short_tag {
        let suffix = format!(":{requested}");
        candidates.iter().find(|image| image.ends_with(&suffix))
    } else {
        candidates.iter().find(|image| image.as_str() == requested)
    };

    found
        .cloned()
        .ok_or_else(|| format!("Invalid version: {requested}"))
}
