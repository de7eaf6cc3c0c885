pub mod env;
pub mod logging;

#[allow(unused_imports)]
pub use env::{fake_environment, get_test_dsn, open_fake_connection};
#[allow(unused_imports)]
pub use logging::init_logging;
