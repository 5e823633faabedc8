//! Tracing setup. Grounded on the teacher's own `logging` sibling crate;
//! reproduced locally here rather than pulled in as a path dependency (see
//! DESIGN.md).

use tracing_subscriber::EnvFilter;

/// Installs a `tracing_subscriber::fmt` layer filtered by `filter`
/// (standard `EnvFilter` syntax, e.g. `"nm_dns_manager=debug"`), falling
/// back to `info` if `filter` fails to parse.
pub fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}
