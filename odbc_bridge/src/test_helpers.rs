//! Shared setup for unit and integration tests.

use std::sync::Once;

static DOTENV: Once = Once::new();

/// Loads `.env` once per process so `ODBC_TEST_DSN` can live outside the
/// shell environment. A missing file is not an error.
pub fn load_dotenv() {
    DOTENV.call_once(|| {
        if let Err(e) = dotenvy::dotenv() {
            log::debug!("No .env loaded: {}", e);
        }
    });
}
