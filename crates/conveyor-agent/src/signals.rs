use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::info;

/// How hard the process has been asked to stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopKind {
    /// First SIGTERM/SIGINT: cancel the running job within its grace
    /// period, disconnect, exit.
    Graceful,
    /// Repeated SIGTERM/SIGINT: kill the job's process group now.
    Forceful,
    /// SIGQUIT: immediate but clean. Cancels the job, still disconnects.
    Quit,
}

/// Combine an already-requested stop with a newly received signal.
///
/// A second graceful request escalates to forceful; quit wins over
/// everything; an established forceful stop never de-escalates.
pub fn escalate(current: Option<StopKind>, incoming: StopKind) -> StopKind {
    match (current, incoming) {
        (None, kind) => kind,
        (Some(_), StopKind::Quit) => StopKind::Quit,
        (Some(StopKind::Graceful), StopKind::Graceful) => StopKind::Forceful,
        (Some(current), _) => current,
    }
}

/// Install SIGTERM/SIGINT/SIGQUIT handlers and expose the requested stop
/// level as a watch channel every worker observes.
pub fn watch_signals() -> std::io::Result<watch::Receiver<Option<StopKind>>> {
    let (tx, rx) = watch::channel(None);
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    tokio::spawn(async move {
        loop {
            let incoming = tokio::select! {
                _ = term.recv() => StopKind::Graceful,
                _ = int.recv() => StopKind::Graceful,
                _ = quit.recv() => StopKind::Quit,
            };
            let next = escalate(*tx.borrow(), incoming);
            info!(kind = ?next, "stop signal received");
            if tx.send(Some(next)).is_err() {
                break;
            }
        }
    });
    Ok(rx)
}
