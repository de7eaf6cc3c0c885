//! Helper functions for reading environment variables and building
//! environments in tests

use odbc_bridge::cli::fake::FakeCli;
use odbc_bridge::test_helpers::load_dotenv;
use odbc_bridge::{Connection, EngineConfig, Environment};
use std::sync::Arc;

/// Get the ODBC_TEST_DSN connection string from environment (or `.env`)
/// Returns None if not set (tests should be skipped in this case)
#[allow(dead_code)]
pub fn get_test_dsn() -> Option<String> {
    load_dotenv();
    std::env::var("ODBC_TEST_DSN")
        .ok()
        .filter(|s| !s.is_empty())
}

/// Environment over a scripted CLI.
#[allow(dead_code)]
pub fn fake_environment() -> (Arc<FakeCli>, Environment) {
    let fake = Arc::new(FakeCli::new());
    let env = Environment::with_cli(fake.clone(), EngineConfig::default())
        .expect("fake environment");
    (fake, env)
}

/// Connected connection over a scripted CLI.
#[allow(dead_code)]
pub fn open_fake_connection() -> (Arc<FakeCli>, Environment, Connection) {
    let (fake, env) = fake_environment();
    let conn = env.create_connection().expect("create connection");
    conn.open_sync("DSN=fake").expect("open");
    (fake, env, conn)
}
