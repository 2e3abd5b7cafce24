//! Application state wiring the engine to its SQLite storage.
//!
//! The engine is generic over its repository; AppState pins it to the
//! concrete infra implementation and registers the built-in service
//! handlers every `tflow` invocation offers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde_json::Map;
use tokenflow_core::context::EngineServices;
use tokenflow_core::service::{ServiceError, ServiceRequest};
use tokenflow_core::ProcessEngine;
use tokenflow_infra::config::load_engine_config;
use tokenflow_infra::filesystem::{ensure_data_dir, resolve_data_dir};
use tokenflow_infra::sqlite::{DatabasePool, SqliteRuntimeRepository};

pub type ConcreteEngine = ProcessEngine<SqliteRuntimeRepository>;

/// Shared state for every CLI command.
#[derive(Clone)]
pub struct AppState {
    pub engine: ConcreteEngine,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Resolve the data directory, open the database and wire the engine.
    pub async fn init() -> anyhow::Result<Self> {
        Self::open(&resolve_data_dir()).await
    }

    pub async fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let db_path = ensure_data_dir(data_dir)
            .await
            .with_context(|| format!("cannot create data directory {}", data_dir.display()))?;
        let db_pool = DatabasePool::open(&db_path)
            .await
            .with_context(|| format!("cannot open database {}", db_path.display()))?;

        let config = load_engine_config(data_dir).await;
        let services = EngineServices::new(config);
        register_builtin_handlers(&services);

        let repo = Arc::new(SqliteRuntimeRepository::new(db_pool.clone()));
        let engine = ProcessEngine::new(repo, Arc::new(services));

        Ok(Self {
            engine,
            data_dir: data_dir.to_path_buf(),
            db_pool,
        })
    }
}

/// Handlers available to service tasks without any embedding code:
/// `noop` does nothing, `log` writes the activity and its variables to the
/// tracing log.
pub fn register_builtin_handlers(services: &EngineServices) {
    services.service_handlers.register(
        "noop",
        Arc::new(|_: &ServiceRequest<'_>| -> Result<Map<String, serde_json::Value>, ServiceError> {
            Ok(Map::new())
        }),
    );
    services.service_handlers.register(
        "log",
        Arc::new(|req: &ServiceRequest<'_>| -> Result<Map<String, serde_json::Value>, ServiceError> {
            tracing::info!(
                process_instance_id = %req.process_instance_id,
                execution_id = %req.execution_id,
                activity_id = req.activity_id,
                variables = %serde_json::Value::Object(req.variables.clone()),
                "service task"
            );
            Ok(Map::new())
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use tokenflow_core::job::JobExecutor;
    use tokenflow_core::StartProcessInstance;
    use tokenflow_types::runtime::ProcessInstanceStatus;

    const ORDER: &str = include_str!("../../../demos/order.yaml");

    fn order(amount: i64) -> StartProcessInstance {
        let vars = json!({ "amount": amount }).as_object().cloned().unwrap();
        StartProcessInstance::new("order").with_variables(vars)
    }

    #[tokio::test]
    async fn open_creates_database_and_registers_handlers() {
        let dir = tempdir().unwrap();
        let state = AppState::open(dir.path()).await.unwrap();

        assert!(dir.path().join("tokenflow.db").exists());
        assert_eq!(
            state.engine.services().service_handlers.names(),
            vec!["log".to_string(), "noop".to_string()]
        );
    }

    #[tokio::test]
    async fn small_order_ships_through_the_job_executor() {
        let dir = tempdir().unwrap();
        let state = AppState::open(dir.path()).await.unwrap();
        state.engine.deploy_yaml(ORDER).await.unwrap();

        let started = state.engine.start_process_instance(order(10)).await.unwrap();
        assert_eq!(started.status, ProcessInstanceStatus::Running);
        let snapshot = state.engine.instance(started.id).await.unwrap().unwrap();
        assert_eq!(snapshot.jobs.len(), 1);
        assert!(snapshot.tasks.is_empty());

        let summary = JobExecutor::new(state.engine.clone()).run_once().await.unwrap();
        assert_eq!(summary.succeeded, 1);
        let snapshot = state.engine.instance(started.id).await.unwrap().unwrap();
        assert_eq!(snapshot.instance.status, ProcessInstanceStatus::Completed);
    }

    #[tokio::test]
    async fn large_order_waits_for_approval_until_cancelled() {
        let dir = tempdir().unwrap();
        let state = AppState::open(dir.path()).await.unwrap();
        state.engine.deploy_yaml(ORDER).await.unwrap();

        let started = state.engine.start_process_instance(order(5000)).await.unwrap();
        let snapshot = state.engine.instance(started.id).await.unwrap().unwrap();
        assert_eq!(snapshot.tasks.len(), 1);
        assert_eq!(snapshot.tasks[0].task_definition_key, "approve");

        let signalled = state
            .engine
            .signal_event_received("cancel-orders", None)
            .await
            .unwrap();
        assert_eq!(signalled.delivered, vec![started.id]);
        let snapshot = state.engine.instance(started.id).await.unwrap().unwrap();
        assert_eq!(snapshot.instance.status, ProcessInstanceStatus::Completed);
        assert!(snapshot.tasks.is_empty());
    }
}
