pub mod app_env;
pub mod app_units;
pub mod apps;
pub mod catalog;
pub mod deploys;
pub mod healer;
pub mod machines;
pub mod nodes;
pub mod pools;
pub mod service_instances;
pub mod tokens;

#[cfg(test)]
pub(crate) mod test_support;
