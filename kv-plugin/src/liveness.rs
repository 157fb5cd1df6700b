//! Termination triggers
//!
//! The host keeps the plugin's stdin open for as long as it wants the plugin
//! alive. EOF on stdin, SIGTERM, or a controller `Shutdown` call all cancel
//! the same [`CancellationToken`], which is the only thing the lifecycle
//! controller waits on.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

/// Cancel `token` once `reader` reaches EOF or fails for good
///
/// Anything the host writes is discarded. Transient read errors are retried
/// after `poll_interval`; they never count as the host going away.
pub async fn watch_host<R>(mut reader: R, token: CancellationToken, poll_interval: Duration)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 256];

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::info!("host closed the liveness channel");
                    token.cancel();
                    return;
                }
                Ok(n) => tracing::trace!(bytes = n, "discarding host input"),
                Err(e) if is_transient(&e) => {
                    tracing::debug!(error = %e, "transient liveness read error, polling again");
                    tokio::time::sleep(poll_interval).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "liveness channel failed, treating host as gone");
                    token.cancel();
                    return;
                }
            },
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Cancel `token` on SIGTERM
///
/// SIGINT is logged and ignored: an interactive Ctrl+C reaches the whole
/// process group, and the host decides when we stop by closing stdin.
#[cfg(unix)]
pub async fn watch_signals(token: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut terminate, mut interrupt) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(terminate), Ok(interrupt)) => (terminate, interrupt),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "failed to install signal handlers");
                return;
            }
        };

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = terminate.recv() => {
                tracing::info!("Received SIGTERM, starting graceful shutdown");
                token.cancel();
                return;
            }
            _ = interrupt.recv() => {
                tracing::debug!("Received SIGINT, ignoring; waiting for the host");
            }
        }
    }
}

/// Signals are not watched on this platform; stdin EOF still applies
#[cfg(not(unix))]
pub async fn watch_signals(token: CancellationToken) {
    token.cancelled().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, ReadBuf};

    #[tokio::test]
    async fn test_eof_cancels() {
        let (host, plugin) = tokio::io::duplex(64);
        let token = CancellationToken::new();
        let task = tokio::spawn(watch_host(plugin, token.clone(), Duration::from_millis(10)));

        drop(host);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_host_data_is_ignored() {
        let (mut host, plugin) = tokio::io::duplex(64);
        let token = CancellationToken::new();
        let task = tokio::spawn(watch_host(plugin, token.clone(), Duration::from_millis(10)));

        host.write_all(b"anything at all\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!token.is_cancelled());

        drop(host);
        task.await.unwrap();
        assert!(token.is_cancelled());
    }

    /// Fails with `Interrupted` a few times, then reports EOF
    struct Flaky {
        failures_left: usize,
    }

    impl AsyncRead for Flaky {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                Poll::Ready(Err(io::Error::from(io::ErrorKind::Interrupted)))
            } else {
                Poll::Ready(Ok(()))
            }
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_not_termination() {
        let token = CancellationToken::new();
        let reader = Flaky { failures_left: 3 };

        // Still alive while errors are transient
        let watch = watch_host(reader, token.clone(), Duration::from_millis(20));
        tokio::pin!(watch);
        let early = tokio::time::timeout(Duration::from_millis(30), &mut watch).await;
        assert!(early.is_err());
        assert!(!token.is_cancelled());

        tokio::time::timeout(Duration::from_secs(1), watch).await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_hard_error_cancels() {
        struct Broken;

        impl AsyncRead for Broken {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
            }
        }

        let token = CancellationToken::new();
        watch_host(Broken, token.clone(), Duration::from_millis(10)).await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_external_cancel_stops_watching() {
        let (_host, plugin) = tokio::io::duplex(64);
        let token = CancellationToken::new();
        let task = tokio::spawn(watch_host(plugin, token.clone(), Duration::from_millis(10)));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
