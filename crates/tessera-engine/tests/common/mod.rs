//! Shared helpers for the integration tests.

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tessera_engine=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
