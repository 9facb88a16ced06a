//! Permission schemes and contexts.
//!
//! A scheme is a dotted path (`app.deploy.image`). A grant on a scheme covers
//! every scheme below it, and the empty scheme covers everything. A grant is
//! scoped to one context; a `global` context matches any requested context.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextType {
    Global,
    Team,
    App,
    Pool,
    Iaas,
    Service,
    ServiceInstance,
}

impl ContextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextType::Global => "global",
            ContextType::Team => "team",
            ContextType::App => "app",
            ContextType::Pool => "pool",
            ContextType::Iaas => "iaas",
            ContextType::Service => "service",
            ContextType::ServiceInstance => "service-instance",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "global" => Some(ContextType::Global),
            "team" => Some(ContextType::Team),
            "app" => Some(ContextType::App),
            "pool" => Some(ContextType::Pool),
            "iaas" => Some(ContextType::Iaas),
            "service" => Some(ContextType::Service),
            "service-instance" => Some(ContextType::ServiceInstance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PermissionContext {
    #[serde(rename = "type")]
    pub ctx_type: ContextType,
    #[serde(default)]
    pub value: String,
}

impl PermissionContext {
    pub fn new(ctx_type: ContextType, value: impl Into<String>) -> Self {
        Self {
            ctx_type,
            value: value.into(),
        }
    }

    pub fn global() -> Self {
        Self::new(ContextType::Global, "")
    }

    pub fn team(value: impl Into<String>) -> Self {
        Self::new(ContextType::Team, value)
    }

    pub fn app(value: impl Into<String>) -> Self {
        Self::new(ContextType::App, value)
    }

    pub fn pool(value: impl Into<String>) -> Self {
        Self::new(ContextType::Pool, value)
    }

    pub fn iaas(value: impl Into<String>) -> Self {
        Self::new(ContextType::Iaas, value)
    }

    pub fn service(value: impl Into<String>) -> Self {
        Self::new(ContextType::Service, value)
    }

    /// Instances are identified as `service/instance`.
    pub fn service_instance(service: &str, instance: &str) -> Self {
        Self::new(ContextType::ServiceInstance, format!("{service}/{instance}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    pub scheme: String,
    pub context: PermissionContext,
}

impl Permission {
    pub fn new(scheme: impl Into<String>, context: PermissionContext) -> Self {
        Self {
            scheme: scheme.into(),
            context,
        }
    }

    /// Grant on every scheme in every context.
    pub fn root() -> Self {
        Self::new("", PermissionContext::global())
    }
}

pub mod schemes {
    pub const APP: &str = "app";
    pub const APP_CREATE: &str = "app.create";
    pub const APP_READ: &str = "app.read";
    pub const APP_READ_DEPLOY: &str = "app.read.deploy";
    pub const APP_READ_EVENTS: &str = "app.read.events";
    pub const APP_READ_ENV: &str = "app.read.env";
    pub const APP_DELETE: &str = "app.delete";
    pub const APP_DEPLOY: &str = "app.deploy";
    pub const APP_DEPLOY_ARCHIVE_URL: &str = "app.deploy.archive-url";
    pub const APP_DEPLOY_GIT: &str = "app.deploy.git";
    pub const APP_DEPLOY_IMAGE: &str = "app.deploy.image";
    pub const APP_DEPLOY_UPLOAD: &str = "app.deploy.upload";
    pub const APP_DEPLOY_BUILD: &str = "app.deploy.build";
    pub const APP_DEPLOY_ROLLBACK: &str = "app.deploy.rollback";
    pub const APP_UPDATE_BIND: &str = "app.update.bind";
    pub const APP_UPDATE_UNBIND: &str = "app.update.unbind";
    pub const APP_UPDATE_ENV_SET: &str = "app.update.env.set";
    pub const APP_UPDATE_ENV_UNSET: &str = "app.update.env.unset";
    pub const APP_UPDATE_UNIT_ADD: &str = "app.update.unit.add";
    pub const APP_UPDATE_UNIT_REMOVE: &str = "app.update.unit.remove";
    pub const APP_TOKEN_CREATE: &str = "app.token.create";

    pub const TOKEN_DELETE: &str = "token.delete";

    pub const NODE_CREATE: &str = "node.create";
    pub const NODE_READ: &str = "node.read";
    pub const NODE_READ_EVENTS: &str = "node.read.events";
    pub const NODE_UPDATE: &str = "node.update";
    pub const NODE_DELETE: &str = "node.delete";

    pub const MACHINE_CREATE: &str = "machine.create";
    pub const MACHINE_READ: &str = "machine.read";
    pub const MACHINE_DELETE: &str = "machine.delete";
    pub const MACHINE_TEMPLATE_CREATE: &str = "machine.template.create";
    pub const MACHINE_TEMPLATE_READ: &str = "machine.template.read";
    pub const MACHINE_TEMPLATE_DELETE: &str = "machine.template.delete";

    pub const POOL_CREATE: &str = "pool.create";
    pub const POOL_READ: &str = "pool.read";
    pub const POOL_DELETE: &str = "pool.delete";
    pub const POOL_UPDATE_TEAM_ADD: &str = "pool.update.team.add";
    pub const POOL_UPDATE_TEAM_REMOVE: &str = "pool.update.team.remove";

    pub const HEALING_READ: &str = "healing.read";
    pub const HEALING_UPDATE: &str = "healing.update";
    pub const HEALING_DELETE: &str = "healing.delete";

    pub const SERVICE: &str = "service";
    pub const SERVICE_CREATE: &str = "service.create";
    pub const SERVICE_READ: &str = "service.read";
    pub const SERVICE_READ_PLANS: &str = "service.read.plans";
    pub const SERVICE_DELETE: &str = "service.delete";

    pub const SERVICE_INSTANCE: &str = "service-instance";
    pub const SERVICE_INSTANCE_CREATE: &str = "service-instance.create";
    pub const SERVICE_INSTANCE_READ: &str = "service-instance.read";
    pub const SERVICE_INSTANCE_READ_STATUS: &str = "service-instance.read.status";
    pub const SERVICE_INSTANCE_READ_EVENTS: &str = "service-instance.read.events";
    pub const SERVICE_INSTANCE_DELETE: &str = "service-instance.delete";
    pub const SERVICE_INSTANCE_UPDATE_DESCRIPTION: &str = "service-instance.update.description";
    pub const SERVICE_INSTANCE_UPDATE_BIND: &str = "service-instance.update.bind";
    pub const SERVICE_INSTANCE_UPDATE_UNBIND: &str = "service-instance.update.unbind";
    pub const SERVICE_INSTANCE_UPDATE_GRANT: &str = "service-instance.update.grant";
    pub const SERVICE_INSTANCE_UPDATE_REVOKE: &str = "service-instance.update.revoke";
    pub const SERVICE_INSTANCE_UPDATE_PROXY: &str = "service-instance.update.proxy";
}

/// True when a grant on `granted` covers `wanted`.
pub fn scheme_covers(granted: &str, wanted: &str) -> bool {
    if granted.is_empty() || granted == wanted {
        return true;
    }
    wanted
        .strip_prefix(granted)
        .is_some_and(|rest| rest.starts_with('.'))
}

/// True when any permission covers `scheme` in one of `contexts`.
///
/// An empty `contexts` slice only matches global grants.
pub fn check(permissions: &[Permission], scheme: &str, contexts: &[PermissionContext]) -> bool {
    permissions.iter().any(|permission| {
        scheme_covers(&permission.scheme, scheme)
            && (permission.context.ctx_type == ContextType::Global
                || contexts.contains(&permission.context))
    })
}

/// Every context in which `scheme` is granted, deduplicated and sorted.
pub fn contexts_for(permissions: &[Permission], scheme: &str) -> Vec<PermissionContext> {
    let mut contexts: Vec<PermissionContext> = permissions
        .iter()
        .filter(|permission| scheme_covers(&permission.scheme, scheme))
        .map(|permission| permission.context.clone())
        .collect();
    contexts.sort();
    contexts.dedup();
    contexts
}

/// Values of the given context type, or `None` when a global grant covers all.
pub fn values_for(
    permissions: &[Permission],
    scheme: &str,
    ctx_type: ContextType,
) -> Option<Vec<String>> {
    let contexts = contexts_for(permissions, scheme);
    if contexts
        .iter()
        .any(|ctx| ctx.ctx_type == ContextType::Global)
    {
        return None;
    }
    Some(
        contexts
            .into_iter()
            .filter(|ctx| ctx.ctx_type == ctx_type)
            .map(|ctx| ctx.value)
            .collect(),
    )
}
