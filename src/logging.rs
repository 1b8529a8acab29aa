//! Tracing setup for hosts and tests.

use tracing_subscriber::FmtSubscriber;

/// Install a plain formatting subscriber as the global default. Safe to
/// call more than once; later calls are no-ops.
pub fn init() {
    let subscriber = FmtSubscriber::builder().with_target(false).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
