use super::connection::{Connection, ConnectionCore};
use super::driver_error;
use super::statement::StatementCore;
use crate::async_bridge::init_runtime;
use crate::cli::{succeeded, Cli, HandleKind, OdbcCli, OwnedHandle, RawHandle};
use crate::config::EngineConfig;
use crate::error::{ErrorState, OdbcError, Result};
use crate::handles::HandleTable;
use std::sync::Arc;

/// State shared by an environment and everything created from it.
pub(crate) struct Context {
    pub(crate) cli: Arc<dyn Cli>,
    pub(crate) env: Arc<OwnedHandle>,
    pub(crate) connections: HandleTable<ConnectionCore>,
    pub(crate) statements: HandleTable<StatementCore>,
    pub(crate) config: EngineConfig,
}

/// Driver-manager session. Owns the environment handle and hands out
/// connections.
pub struct Environment {
    ctx: Arc<Context>,
}

impl Environment {
    /// Environment over the system driver manager, configured from
    /// `ODBC_BRIDGE_*` variables.
    pub fn new() -> Result<Self> {
        Self::with_cli(Arc::new(OdbcCli::new()), EngineConfig::from_env())
    }

    pub fn with_cli(cli: Arc<dyn Cli>, config: EngineConfig) -> Result<Self> {
        init_runtime(&config)?;

        let raw = cli.alloc_handle(HandleKind::Env, RawHandle::NULL).map_err(|rc| {
            OdbcError::from_state(
                &ErrorState::placeholder(format!("SQLAllocHandle(): error {}", rc.0)),
                &config.error_label,
            )
        })?;
        let env = OwnedHandle::new(Arc::clone(&cli), HandleKind::Env, raw);

        let rc = cli.set_env_odbc_version(raw);
        if !succeeded(rc) {
            return Err(driver_error(&*cli, HandleKind::Env, raw, &config.error_label));
        }
        log::debug!("ODBC environment allocated");

        Ok(Self {
            ctx: Arc::new(Context {
                cli,
                env: Arc::new(env),
                connections: HandleTable::new("connection"),
                statements: HandleTable::new("statement"),
                config,
            }),
        })
    }

    /// Allocates a disconnected connection using the configured login
    /// timeout.
    pub fn create_connection(&self) -> Result<Connection> {
        let ctx = &self.ctx;
        let env = ctx.env.raw();
        let raw = ctx
            .cli
            .alloc_handle(HandleKind::Dbc, env)
            .map_err(|_| driver_error(&*ctx.cli, HandleKind::Env, env, &ctx.config.error_label))?;

        let core = ConnectionCore::new(
            Arc::clone(&ctx.cli),
            Arc::clone(&ctx.env),
            OwnedHandle::new(Arc::clone(&ctx.cli), HandleKind::Dbc, raw),
            ctx.config.connect_timeout_secs,
            &ctx.config.error_label,
        );
        let id = ctx.connections.insert(core)?;
        Ok(Connection::new(id, Arc::clone(ctx)))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn connection_count(&self) -> usize {
        self.ctx.connections.len()
    }

    pub fn statement_count(&self) -> usize {
        self.ctx.statements.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::fake::{FakeCli, FakeOp};

    #[test]
    fn test_environment_sets_odbc_version() {
        let fake = Arc::new(FakeCli::new());
        let env = Environment::with_cli(fake.clone(), EngineConfig::default()).unwrap();

        assert_eq!(fake.live_handles(HandleKind::Env), 1);
        assert!(fake
            .calls()
            .contains(&"SQLSetEnvAttr(OdbcVersion)".to_string()));
        assert_eq!(env.connection_count(), 0);
    }

    #[test]
    fn test_environment_version_failure_frees_handle() {
        let fake = Arc::new(FakeCli::new());
        fake.fail(FakeOp::SetEnvAttr, "HY024", "Invalid attribute value");

        let err = Environment::with_cli(fake.clone(), EngineConfig::default())
            .err()
            .expect("version failure");
        assert_eq!(err.sql_state(), Some("HY024"));
        assert_eq!(fake.live_handles(HandleKind::Env), 0);
    }

    #[test]
    fn test_environment_alloc_failure() {
        let fake = Arc::new(FakeCli::new());
        fake.script_return(FakeOp::AllocHandle, crate::cli::SqlReturn::ERROR);

        let err = Environment::with_cli(fake, EngineConfig::default())
            .err()
            .expect("alloc failure");
        assert_eq!(err.sql_state(), Some(crate::error::PLACEHOLDER_STATE));
    }

    #[test]
    fn test_create_connection_uses_configured_timeout() {
        let fake = Arc::new(FakeCli::new());
        let config = EngineConfig {
            connect_timeout_secs: 12,
            ..EngineConfig::default()
        };
        let env = Environment::with_cli(fake.clone(), config).unwrap();
        let conn = env.create_connection().unwrap();

        assert!(!conn.connected());
        assert_eq!(conn.connect_timeout(), 12);
        assert_eq!(env.connection_count(), 1);
        assert_eq!(fake.live_handles(HandleKind::Dbc), 1);
    }

    #[test]
    fn test_environment_outlives_dropped_wrapper() {
        let fake = Arc::new(FakeCli::new());
        let env = Environment::with_cli(fake.clone(), EngineConfig::default()).unwrap();
        let conn = env.create_connection().unwrap();
        drop(env);

        // The connection keeps the environment handle alive.
        assert_eq!(fake.live_handles(HandleKind::Env), 1);
        drop(conn);
        assert_eq!(fake.live_handles(HandleKind::Dbc), 0);
        assert_eq!(fake.live_handles(HandleKind::Env), 0);
    }
}
