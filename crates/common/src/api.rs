//! API DTOs exchanged with the control plane.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Content type of newline-delimited JSON progress streams.
pub const JSON_STREAM_CONTENT_TYPE: &str = "application/x-json-stream";

/// One frame of a JSON progress stream.
///
/// Frames are written one per line. A stream ends either normally or with a
/// single frame carrying `Error`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct StreamFrame {
    /// Progress text.
    #[serde(rename = "Message", default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Terminal error text.
    #[serde(rename = "Error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamFrame {
    /// Frame with a progress message.
    pub fn message(msg: impl Into<String>) -> Self {
        Self {
            message: Some(msg.into()),
            error: None,
        }
    }

    /// Frame with an error.
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            message: None,
            error: Some(msg.into()),
        }
    }
}

/// How a deploy was requested.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
pub enum DeployKind {
    /// Provisioner fetches and builds an archive.
    #[serde(rename = "archive-url")]
    ArchiveUrl,
    /// Archive URL pushed by a git hook, with a commit.
    #[serde(rename = "git")]
    Git,
    /// Prebuilt image.
    #[serde(rename = "image")]
    Image,
    /// Uploaded file, built and rolled out.
    #[serde(rename = "upload")]
    Upload,
    /// Uploaded file, built only.
    #[serde(rename = "uploadbuild")]
    UploadBuild,
    /// Roll back to an earlier image.
    #[serde(rename = "rollback")]
    Rollback,
    /// Nothing specific was provided.
    #[serde(rename = "app-deploy")]
    AppDeploy,
}

impl DeployKind {
    /// Returns the canonical wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployKind::ArchiveUrl => "archive-url",
            DeployKind::Git => "git",
            DeployKind::Image => "image",
            DeployKind::Upload => "upload",
            DeployKind::UploadBuild => "uploadbuild",
            DeployKind::Rollback => "rollback",
            DeployKind::AppDeploy => "app-deploy",
        }
    }

    /// Parses a wire name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "archive-url" => Some(DeployKind::ArchiveUrl),
            "git" => Some(DeployKind::Git),
            "image" => Some(DeployKind::Image),
            "upload" => Some(DeployKind::Upload),
            "uploadbuild" => Some(DeployKind::UploadBuild),
            "rollback" => Some(DeployKind::Rollback),
            "app-deploy" => Some(DeployKind::AppDeploy),
            _ => None,
        }
    }
}

/// Persisted deploy record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct DeployData {
    /// Deploy identifier.
    pub id: Uuid,
    /// Target application.
    pub app: String,
    /// Start of the deploy.
    pub timestamp: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: i64,
    /// Commit SHA for git deploys.
    #[serde(default)]
    pub commit: String,
    /// Error text; empty when the deploy succeeded.
    #[serde(default)]
    pub error: String,
    /// Image produced or selected.
    #[serde(default)]
    pub image: String,
    /// Origin tag (`git`, `image`, `rollback`, `app-deploy`, `drag-and-drop`).
    #[serde(default)]
    pub origin: String,
    /// Deploy kind.
    pub kind: DeployKind,
    /// Requesting principal.
    #[serde(default)]
    pub user: String,
    /// Saved textual diff.
    #[serde(default)]
    pub diff: String,
    /// Whether the image may be used as a rollback target.
    pub can_rollback: bool,
    /// Set when the record is scheduled for removal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_at: Option<DateTime<Utc>>,
}

/// Lock state embedded in an application.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct AppLock {
    /// Whether a mutating operation holds the app.
    pub locked: bool,
    /// What the holder is doing.
    #[serde(default)]
    pub reason: String,
    /// Who holds the lock.
    #[serde(default)]
    pub owner: String,
    /// When the lock was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquired_at: Option<DateTime<Utc>>,
}

/// One environment variable of an application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Value; masked when the variable is sensitive.
    pub value: String,
    /// Whether the variable was set by the user rather than a service.
    pub public: bool,
    /// Whether the value must not be displayed.
    #[serde(default)]
    pub sensitive: bool,
    /// Service instance that injected the variable, as `service/instance`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

/// Application description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct AppInfo {
    /// Unique lowercase name.
    pub name: String,
    /// Runtime family.
    pub platform: String,
    /// Plan name.
    pub plan: String,
    /// Pool the app runs in.
    pub pool: String,
    /// Owning team.
    pub team_owner: String,
    /// Teams with access; always contains the owner.
    pub teams: Vec<String>,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Number of successful deploys.
    pub deploys: i64,
    /// Image currently rolled out.
    #[serde(default)]
    pub current_image: String,
    /// Lock state.
    pub lock: AppLock,
    /// Environment, sensitive values masked.
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Node status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Node accepts units.
    Ready,
    /// Node was disabled by an operator.
    Disabled,
}

/// Node registered with a provisioner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct NodeView {
    /// http[s] address.
    pub address: String,
    /// Owning pool.
    pub pool: String,
    /// Provisioner holding the node.
    pub provisioner: String,
    /// Status text. Pseudo-nodes that stand for a failing provisioner use `ERROR: ...`.
    pub status: String,
    /// Metadata, including reserved keys.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// IaaS machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct MachineView {
    /// IaaS-side identifier.
    pub id: String,
    /// IaaS backend name.
    pub iaas: String,
    /// Host address.
    pub address: String,
    /// Parameters the machine was created with.
    #[serde(default)]
    pub creation_params: BTreeMap<String, String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Named set of machine creation parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct TemplateView {
    /// Template name.
    pub name: String,
    /// IaaS backend the template targets.
    pub iaas: String,
    /// Creation parameters merged under explicit ones.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Node listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct NodeListResponse {
    /// Nodes across all node provisioners.
    pub nodes: Vec<NodeView>,
    /// Machines not backing any listed node.
    pub machines: Vec<MachineView>,
}

/// Single node with its backing machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct NodeInfoResponse {
    /// The node.
    pub node: NodeView,
    /// Backing machine, when the node was created through an IaaS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<MachineView>,
    /// Units placed on the node.
    #[serde(default)]
    pub units: Vec<UnitView>,
}

/// App unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct UnitView {
    pub id: String,
    pub app: String,
    /// Address of the node running the unit, empty when unplaced.
    pub node: String,
    pub ip: String,
    pub status: String,
}

/// Pool description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct PoolView {
    /// Unique name.
    pub name: String,
    /// Whether apps land here when they name no pool.
    pub default: bool,
    /// Provisioner for the pool's nodes; empty means the configured default.
    pub provisioner: String,
    /// Allowed teams; empty means public.
    pub teams: Vec<String>,
}

/// Node healer policy for one pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct HealerConfigView {
    /// Whether healing is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// `enabled` came from the base entry.
    #[serde(default)]
    pub enabled_inherited: bool,
    /// Seconds without a heartbeat before a node is considered down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unresponsive_secs: Option<i64>,
    /// `max_unresponsive_secs` came from the base entry.
    #[serde(default)]
    pub max_unresponsive_inherited: bool,
    /// Seconds since the last successful operation before a node is considered down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_since_success_secs: Option<i64>,
    /// `max_since_success_secs` came from the base entry.
    #[serde(default)]
    pub max_since_success_inherited: bool,
}

/// One healing action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct HealingEventView {
    /// Record identifier.
    pub id: Uuid,
    /// `node-healing` or `container-healing`.
    pub action: String,
    /// Failing node address or container id.
    pub failing: String,
    /// Replacement node address or container id; empty when healing failed.
    #[serde(default)]
    pub created: String,
    /// Start time.
    pub start_time: DateTime<Utc>,
    /// End time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Error text.
    #[serde(default)]
    pub error: String,
    /// Whether healing succeeded.
    pub successful: bool,
}

/// Service catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ServiceView {
    /// Unique name.
    pub name: String,
    /// Broker endpoints by environment; `production` is always present.
    pub endpoint: BTreeMap<String, String>,
    /// Teams administering the service.
    pub owner_teams: Vec<String>,
    /// Teams allowed to use a restricted service.
    pub teams: Vec<String>,
    /// Whether only `teams` may create instances.
    pub restricted: bool,
    /// Documentation text.
    #[serde(default)]
    pub doc: String,
}

/// Broker plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ServicePlan {
    /// Plan name.
    pub name: String,
    /// Plan description.
    #[serde(default)]
    pub description: String,
}

/// Service instance description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ServiceInstanceInfo {
    /// Service the instance belongs to.
    pub service_name: String,
    /// Instance name, unique within the service.
    pub name: String,
    /// Plan name.
    #[serde(default)]
    pub plan_name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Owning team.
    pub team_owner: String,
    /// Teams with access.
    pub teams: Vec<String>,
    /// Bound applications.
    pub apps: Vec<String>,
    /// Tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Additional information reported by the broker.
    #[serde(default)]
    pub custom_info: BTreeMap<String, String>,
}

/// Event target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct EventTarget {
    /// Target type (`app`, `node`, `service-instance`, ...).
    #[serde(rename = "type")]
    pub target_type: String,
    /// Target value.
    pub value: String,
}

/// Event log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct EventView {
    /// Event identifier.
    pub id: Uuid,
    /// What the event acted on.
    pub target: EventTarget,
    /// Permission scheme naming the operation.
    pub kind: String,
    /// Principal that started the operation.
    pub owner: String,
    /// Start time.
    pub start_time: DateTime<Utc>,
    /// End time; absent while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Whether the operation is still running.
    pub running: bool,
    /// Error text.
    #[serde(default)]
    pub error: String,
    /// Data recorded at start.
    #[serde(default)]
    pub custom_data: serde_json::Value,
    /// Data recorded at the end.
    #[serde(default)]
    pub end_custom_data: serde_json::Value,
}
