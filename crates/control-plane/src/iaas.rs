//! IaaS backends that create the machines under nodes.

use std::collections::BTreeMap;
use std::sync::Arc;

use common::api::MachineView;
use tracing::{info, warn};

use crate::error::{ApiResult, AppError};
use crate::persistence::{Db, MachineRecord, NewMachine, machines};
use crate::provision::BoxFuture;

/// Parameter naming the backend inside creation params.
pub const IAAS_PARAM: &str = "iaas";
/// Parameter naming a template inside creation params.
pub const TEMPLATE_PARAM: &str = "template";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub id: String,
    /// Host or IP, without scheme or port.
    pub address: String,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
}

pub trait Iaas: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Operator-facing hint about the parameters this backend expects.
    fn describe(&self) -> String {
        String::new()
    }

    fn create_machine(&self, params: BTreeMap<String, String>) -> BoxFuture<'_, crate::Result<Machine>>;

    fn delete_machine<'a>(&'a self, machine: &'a MachineRecord) -> BoxFuture<'a, crate::Result<()>>;
}

#[derive(Clone, Default)]
pub struct IaasRegistry {
    backends: Arc<BTreeMap<String, Arc<dyn Iaas>>>,
    default_name: Option<String>,
}

impl IaasRegistry {
    pub fn new(default_name: Option<String>, backends: Vec<Arc<dyn Iaas>>) -> Self {
        let backends = backends
            .into_iter()
            .map(|backend| (backend.name().to_string(), backend))
            .collect();
        Self {
            backends: Arc::new(backends),
            default_name,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// Backend by name, the configured default when `name` is empty.
    pub fn get(&self, name: Option<&str>) -> ApiResult<Arc<dyn Iaas>> {
        let name = match name.filter(|n| !n.is_empty()) {
            Some(name) => name,
            None => self
                .default_name
                .as_deref()
                .ok_or_else(|| AppError::bad_request("no iaas specified and no default iaas configured"))?,
        };
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("IaaS \"{name}\" not registered")))
    }

    /// Short description used to annotate node creation failures.
    pub fn describe(&self, name: Option<&str>) -> String {
        self.get(name).map(|iaas| iaas.describe()).unwrap_or_default()
    }
}

/// Merge a stored template under the explicit params. Explicit params win.
pub async fn expand_template(
    db: &Db,
    mut params: BTreeMap<String, String>,
) -> ApiResult<BTreeMap<String, String>> {
    let Some(template_name) = params.remove(TEMPLATE_PARAM).filter(|t| !t.is_empty()) else {
        return Ok(params);
    };
    let Some(template) = machines::get_template(db, &template_name).await? else {
        return Err(AppError::not_found(format!(
            "template \"{template_name}\" not found"
        )));
    };

    let mut expanded = template.params.0.clone();
    expanded.insert(IAAS_PARAM.to_string(), template.iaas.clone());
    expanded.extend(params);
    expanded.insert(TEMPLATE_PARAM.to_string(), template_name);
    Ok(expanded)
}

/// Create a machine through the backend named by `params["iaas"]` and record it.
pub async fn create_machine(
    db: &Db,
    registry: &IaasRegistry,
    params: BTreeMap<String, String>,
) -> ApiResult<MachineRecord> {
    let backend = registry.get(params.get(IAAS_PARAM).map(String::as_str))?;
    let machine = backend.create_machine(params.clone()).await.map_err(|err| {
        warn!(?err, iaas = backend.name(), "machine creation failed");
        AppError::upstream(format!("error creating machine: {err}"))
    })?;

    let record = machines::insert_machine(
        db,
        NewMachine {
            id: machine.id,
            iaas: backend.name().to_string(),
            address: machine.address,
            creation_params: params,
            ca_cert: machine.ca_cert,
            client_cert: machine.client_cert,
        },
    )
    .await?;
    info!(machine_id = %record.id, iaas = %record.iaas, address = %record.address, "machine created");
    Ok(record)
}

/// Destroy a machine at its backend and forget it.
pub async fn destroy_machine(db: &Db, registry: &IaasRegistry, record: &MachineRecord) -> ApiResult<()> {
    let backend = registry.get(Some(&record.iaas))?;
    backend
        .delete_machine(record)
        .await
        .map_err(|err| AppError::upstream(format!("error destroying machine: {err}")))?;
    machines::delete_machine(db, &record.id).await?;
    info!(machine_id = %record.id, iaas = %record.iaas, "machine destroyed");
    Ok(())
}

pub fn machine_view(record: &MachineRecord) -> MachineView {
    MachineView {
        id: record.id.clone(),
        iaas: record.iaas.clone(),
        address: record.address.clone(),
        creation_params: record.creation_params.0.clone(),
        created_at: record.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{FakeIaas, setup_state};

    #[tokio::test]
    async fn templates_fill_missing_params() {
        let state = setup_state().await;
        machines::upsert_template(
            &state.db,
            "small",
            "fake",
            &BTreeMap::from([
                ("size".to_string(), "s1".to_string()),
                ("region".to_string(), "east".to_string()),
            ]),
        )
        .await
        .unwrap();

        let expanded = expand_template(
            &state.db,
            BTreeMap::from([
                ("template".to_string(), "small".to_string()),
                ("region".to_string(), "west".to_string()),
            ]),
        )
        .await
        .unwrap();
        assert_eq!(expanded.get("iaas").map(String::as_str), Some("fake"));
        assert_eq!(expanded.get("size").map(String::as_str), Some("s1"));
        assert_eq!(expanded.get("region").map(String::as_str), Some("west"));

        let missing = expand_template(
            &state.db,
            BTreeMap::from([("template".to_string(), "huge".to_string())]),
        )
        .await
        .unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn machines_are_recorded_and_destroyed() {
        let state = setup_state().await;
        let registry = IaasRegistry::new(Some("fake".into()), vec![Arc::new(FakeIaas::default())]);

        let record = create_machine(&state.db, &registry, BTreeMap::new()).await.unwrap();
        assert_eq!(record.iaas, "fake");
        assert!(machines::get_machine(&state.db, &record.id).await.unwrap().is_some());

        destroy_machine(&state.db, &registry, &record).await.unwrap();
        assert!(machines::get_machine(&state.db, &record.id).await.unwrap().is_none());

        let err = registry.get(Some("ec2")).err().expect("unknown backend");
        assert!(err.is_not_found());
        assert!(IaasRegistry::default().get(None).is_err());
    }
}
