//! Built-in provisioner that keeps nodes and units in the control-plane store.
//!
//! It performs no real container work: builds and rollouts are bookkeeping
//! with progress output, which makes it the default for single-host setups
//! and for tests.

use std::collections::{BTreeMap, HashMap};

use common::api::{DeployKind, NodeStatus as ApiNodeStatus};
use tracing::info;
use url::Url;
use uuid::Uuid;

use super::{
    AddNodeOptions, BoxFuture, DeployArgs, Node, NodeProvisioner, Provisioner, RemoveNodeOptions,
    RollbackArgs, Unit, UpdateNodeOptions, resolve_rollback_image,
};
use crate::persistence::{AppRecord, Db, NewNode, NewUnit, NodeRecord, NodeStatus, UnitRecord, nodes};
use crate::streaming::StreamWriter;

pub const LOCAL_PROVISIONER: &str = "local";

#[derive(Clone)]
pub struct LocalProvisioner {
    db: Db,
    name: String,
}

impl LocalProvisioner {
    pub fn new(db: Db) -> Self {
        Self::named(db, LOCAL_PROVISIONER)
    }

    pub fn named(db: Db, name: impl Into<String>) -> Self {
        Self {
            db,
            name: name.into(),
        }
    }

    async fn ensure_open(&self, out: &StreamWriter) -> crate::Result<()> {
        if out.is_closed() {
            anyhow::bail!("deploy canceled by client");
        }
        Ok(())
    }

    /// Ready nodes of the app's pool, least loaded first.
    async fn placement_candidates(&self, pool: &str) -> crate::Result<Vec<(NodeRecord, usize)>> {
        let mut candidates = Vec::new();
        for node in nodes::list_nodes(&self.db, &self.name).await? {
            if node.pool != pool || node.status != NodeStatus::Ready {
                continue;
            }
            let load = nodes::list_units_on_node(&self.db, &node.address).await?.len();
            candidates.push((node, load));
        }
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.address.cmp(&b.0.address)));
        Ok(candidates)
    }

    async fn start_units(&self, app: &AppRecord, count: u32) -> crate::Result<Vec<Unit>> {
        let mut candidates = self.placement_candidates(&app.pool).await?;
        let mut started = Vec::new();
        for _ in 0..count {
            let (node_address, ip) = match candidates.first_mut() {
                Some((node, load)) => {
                    *load += 1;
                    (node.address.clone(), host_of(&node.address))
                }
                None => (String::new(), String::new()),
            };
            candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.address.cmp(&b.0.address)));

            let id = format!("{}-{}", app.name, &Uuid::new_v4().simple().to_string()[..8]);
            let record = nodes::insert_unit(
                &self.db,
                NewUnit {
                    id,
                    app: app.name.clone(),
                    provisioner: self.name.clone(),
                    node_address,
                    ip,
                },
            )
            .await?;
            started.push(unit_from_record(record));
        }
        Ok(started)
    }

    async fn roll_out(&self, app: &AppRecord, image: &str, out: &StreamWriter) -> crate::Result<()> {
        let units = nodes::list_units_for_app(&self.db, &app.name).await?;
        if units.is_empty() {
            out.line("---- Starting 1 new unit ----").await;
            for unit in self.start_units(app, 1).await? {
                out.line(&format!(" ---> Started unit {} [{image}]", unit.id)).await;
            }
            return Ok(());
        }

        out.line(&format!("---- Updating {} units ----", units.len())).await;
        for unit in units {
            self.ensure_open(out).await?;
            out.line(&format!(" ---> Restarted unit {} [{image}]", unit.id)).await;
        }
        Ok(())
    }
}

impl Provisioner for LocalProvisioner {
    fn name(&self) -> &str {
        &self.name
    }

    fn provision<'a>(&'a self, app: &'a AppRecord) -> BoxFuture<'a, crate::Result<()>> {
        Box::pin(async move {
            info!(app = %app.name, provisioner = %self.name, "app provisioned");
            Ok(())
        })
    }

    fn destroy<'a>(&'a self, app: &'a AppRecord) -> BoxFuture<'a, crate::Result<()>> {
        Box::pin(async move {
            let removed = nodes::delete_units_for_app(&self.db, &app.name).await?;
            info!(app = %app.name, removed, "app units destroyed");
            Ok(())
        })
    }

    fn deploy<'a>(
        &'a self,
        args: DeployArgs,
        out: StreamWriter,
    ) -> BoxFuture<'a, crate::Result<String>> {
        Box::pin(async move {
            let image = args.target_image.clone();
            match args.kind {
                DeployKind::Image => {
                    let source = args.source_image.as_deref().unwrap_or_default();
                    out.line(&format!("---- Pulling image {source} ----")).await;
                }
                DeployKind::ArchiveUrl | DeployKind::Git => {
                    let url = args.archive_url.as_deref().unwrap_or_default();
                    Url::parse(url).map_err(|err| anyhow::anyhow!("invalid archive url {url:?}: {err}"))?;
                    out.line("---- Building application image ----").await;
                    out.line(&format!(" ---> Downloading {url}")).await;
                    if let Some(commit) = args.commit.as_deref().filter(|c| !c.is_empty()) {
                        out.line(&format!(" ---> Commit {commit}")).await;
                    }
                }
                DeployKind::Upload | DeployKind::UploadBuild => {
                    let size = args.file.as_ref().map(|file| file.len()).unwrap_or_default();
                    out.line("---- Building application image ----").await;
                    out.line(&format!(" ---> Received {size} bytes")).await;
                }
                DeployKind::AppDeploy | DeployKind::Rollback => {
                    out.line("---- Building application image ----").await;
                }
            }
            self.ensure_open(&out).await?;
            out.line(&format!(" ---> Tagged as {image}")).await;

            if args.build_only {
                return Ok(image);
            }
            self.roll_out(&args.app, &image, &out).await?;
            Ok(image)
        })
    }

    fn rollback<'a>(
        &'a self,
        args: RollbackArgs,
        out: StreamWriter,
    ) -> BoxFuture<'a, crate::Result<String>> {
        Box::pin(async move {
            out.message("Rollback deploy called").await;
            let image = resolve_rollback_image(&args.requested_image, &args.candidates)
                .map_err(|msg| anyhow::anyhow!(msg))?;
            out.message(format!("Rolling back to image {image}")).await;
            for unit in nodes::list_units_for_app(&self.db, &args.app.name).await? {
                self.ensure_open(&out).await?;
                out.message(format!("Restarted unit {}", unit.id)).await;
            }
            Ok(image)
        })
    }

    fn units<'a>(&'a self, app: &'a AppRecord) -> BoxFuture<'a, crate::Result<Vec<Unit>>> {
        Box::pin(async move {
            Ok(nodes::list_units_for_app(&self.db, &app.name)
                .await?
                .into_iter()
                .map(unit_from_record)
                .collect())
        })
    }

    fn add_units<'a>(
        &'a self,
        app: &'a AppRecord,
        count: u32,
    ) -> BoxFuture<'a, crate::Result<Vec<Unit>>> {
        Box::pin(async move { self.start_units(app, count).await })
    }

    fn remove_units<'a>(&'a self, app: &'a AppRecord, count: u32) -> BoxFuture<'a, crate::Result<()>> {
        Box::pin(async move {
            let units = nodes::list_units_for_app(&self.db, &app.name).await?;
            if (count as usize) > units.len() {
                anyhow::bail!(
                    "cannot remove {count} units from app {}, it has {}",
                    app.name,
                    units.len()
                );
            }
            for unit in units.iter().rev().take(count as usize) {
                nodes::delete_unit(&self.db, &unit.id).await?;
            }
            Ok(())
        })
    }

    fn as_node_provisioner(&self) -> Option<&dyn NodeProvisioner> {
        Some(self)
    }
}

impl NodeProvisioner for LocalProvisioner {
    fn list_nodes(&self) -> BoxFuture<'_, crate::Result<Vec<Node>>> {
        Box::pin(async move {
            Ok(nodes::list_nodes(&self.db, &self.name)
                .await?
                .into_iter()
                .map(node_from_record)
                .collect())
        })
    }

    fn get_node<'a>(&'a self, address: &'a str) -> BoxFuture<'a, crate::Result<Option<Node>>> {
        Box::pin(async move {
            Ok(nodes::get_node(&self.db, address)
                .await?
                .filter(|node| node.provisioner == self.name)
                .map(node_from_record))
        })
    }

    fn add_node(&self, opts: AddNodeOptions) -> BoxFuture<'_, crate::Result<()>> {
        Box::pin(async move {
            nodes::insert_node(
                &self.db,
                NewNode {
                    address: opts.address.clone(),
                    provisioner: self.name.clone(),
                    pool: opts.pool,
                    status: NodeStatus::Ready,
                    metadata: opts.metadata,
                },
            )
            .await?;
            info!(address = %opts.address, "node added");
            Ok(())
        })
    }

    fn remove_node(&self, opts: RemoveNodeOptions) -> BoxFuture<'_, crate::Result<()>> {
        Box::pin(async move {
            let Some(node) = nodes::get_node(&self.db, &opts.address)
                .await?
                .filter(|node| node.provisioner == self.name)
            else {
                anyhow::bail!("node not found");
            };

            let units = nodes::list_units_on_node(&self.db, &node.address).await?;
            let mut targets: Vec<(NodeRecord, usize)> = if opts.rebalance {
                self.placement_candidates(&node.pool)
                    .await?
                    .into_iter()
                    .filter(|(candidate, _)| candidate.address != node.address)
                    .collect()
            } else {
                Vec::new()
            };

            let mut moved: HashMap<String, usize> = HashMap::new();
            for unit in units {
                let destination = match targets.first_mut() {
                    Some((target, load)) => {
                        *load += 1;
                        target.address.clone()
                    }
                    None => String::new(),
                };
                targets.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.address.cmp(&b.0.address)));
                nodes::move_unit(&self.db, &unit.id, &destination).await?;
                *moved.entry(destination).or_default() += 1;
            }

            nodes::delete_node(&self.db, &node.address).await?;
            info!(address = %node.address, rebalance = opts.rebalance, ?moved, "node removed");
            Ok(())
        })
    }

    fn update_node(&self, opts: UpdateNodeOptions) -> BoxFuture<'_, crate::Result<()>> {
        Box::pin(async move {
            let Some(node) = nodes::get_node(&self.db, &opts.address)
                .await?
                .filter(|node| node.provisioner == self.name)
            else {
                anyhow::bail!("node not found");
            };

            let mut metadata: BTreeMap<String, String> = node.metadata.0.clone();
            for (key, value) in opts.metadata {
                if value.is_empty() {
                    metadata.remove(&key);
                } else {
                    metadata.insert(key, value);
                }
            }
            let status = if opts.enable {
                NodeStatus::Ready
            } else if opts.disable {
                NodeStatus::Disabled
            } else {
                node.status
            };
            let pool = opts.pool.unwrap_or(node.pool);

            nodes::update_node(&self.db, &node.address, &pool, status, &metadata).await?;
            Ok(())
        })
    }
}

fn node_from_record(record: NodeRecord) -> Node {
    Node {
        address: record.address,
        pool: record.pool,
        status: match record.status {
            NodeStatus::Ready => ApiNodeStatus::Ready,
            NodeStatus::Disabled => ApiNodeStatus::Disabled,
        },
        metadata: record.metadata.0,
    }
}

fn unit_from_record(record: UnitRecord) -> Unit {
    Unit {
        id: record.id,
        app: record.app,
        node_address: record.node_address,
        ip: record.ip,
        status: record.status,
    }
}

fn host_of(address: &str) -> String {
    Url::parse(address)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_default()
}
