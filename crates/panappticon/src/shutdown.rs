//! Process-wide cleanup on SIGINT and SIGTERM.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::runtime::Handle;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Whether a shutdown hook has been installed in this process.
#[must_use]
pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::SeqCst)
}

/// Run `cleanup` and exit with status 0 when SIGINT or SIGTERM arrives.
///
/// Only the first call installs a hook; later calls return `false` and drop
/// their `cleanup`. Returns `false` as well when called outside a tokio
/// runtime. `cleanup` runs on the blocking pool and must tolerate having
/// already run as part of a graceful quit.
pub fn install_once<F>(cleanup: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    let Ok(handle) = Handle::try_current() else {
        warn!("No runtime, shutdown hook not installed");
        return false;
    };
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return false;
    }

    let (mut terminate, mut interrupt) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(terminate), Ok(interrupt)) => (terminate, interrupt),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Could not register signal handlers");
                INSTALLED.store(false, Ordering::SeqCst);
                return false;
            }
        };

    handle.spawn(async move {
        let name = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        };
        info!(signal = name, "Shutting down");
        if let Err(e) = tokio::task::spawn_blocking(cleanup).await {
            warn!(error = %e, "Cleanup failed");
        }
        std::process::exit(0);
    });
    true
}
