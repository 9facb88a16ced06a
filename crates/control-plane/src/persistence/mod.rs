use sqlx::SqlitePool;

pub mod apps;
pub mod deploys;
pub mod events;
pub mod healer;
pub mod machines;
pub mod migrations;
pub mod nodes;
pub mod pools;
pub mod services;
pub mod tokens;
pub mod users;

pub type Db = SqlitePool;

pub use apps::{AppRecord, EnvEntry, NewApp};
pub use deploys::{DeployFilter, DeployRecord, NewDeploy};
pub use events::{EventFilter, EventRecord, NewEvent};
pub use healer::{
    HealerConfigRecord, HealerConfigUpdate, HealerField, HealingAction, HealingEventRecord,
    NewHealingEvent,
};
pub use machines::{MachineRecord, NewMachine, TemplateRecord};
pub use migrations::{MigrationLabel, MigrationRunOutcome, MigrationSnapshot};
pub use nodes::{NewNode, NewUnit, NodeRecord, NodeStatus, UnitRecord};
pub use pools::{NewPool, PoolRecord};
pub use services::{
    InstanceChanges, InstanceFilter, InstanceRecord, NewInstance, NewService, ServiceRecord,
};
pub use tokens::{NewToken, TokenKind, TokenRecord};
pub use users::{RoleGrantRecord, UserRecord};
