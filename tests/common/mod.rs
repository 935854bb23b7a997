use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Installs a process-wide tracing subscriber for integration tests. Safe
/// to call more than once; later calls are no-ops.
pub fn init() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
