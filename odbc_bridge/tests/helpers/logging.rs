/// Routes `log` output through env_logger; honours `RUST_LOG`.
#[allow(dead_code)]
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
