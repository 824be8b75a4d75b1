use crate::config::StopSignal;
use tokio::sync::watch;

/// Spawn listeners for the configured stop signals, flipping `tx` to `true`
/// when one arrives. Repeated signals are coalesced: the watch channel
/// carries only the fact that a shutdown was requested.
///
/// The listener tasks stay alive for the rest of the process so the signal
/// dispositions remain installed.
pub(crate) fn listen(signals: &[StopSignal], tx: watch::Sender<bool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for stop in signals {
            let kind = match stop {
                StopSignal::Interrupt => SignalKind::interrupt(),
                StopSignal::Terminate => SignalKind::terminate(),
                StopSignal::Hangup => SignalKind::hangup(),
            };
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(signal = ?stop, error = %err, "unable to install signal handler");
                    continue;
                }
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    let _ = tx.send(true);
                }
            });
        }
    }

    #[cfg(not(unix))]
    {
        if !signals.is_empty() {
            let tx = tx.clone();
            tokio::spawn(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    let _ = tx.send(true);
                }
            });
        }
    }

    let _ = tx;
}
