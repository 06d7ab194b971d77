use std::pin::Pin;

use futures::stream::{select_all, Stream, StreamExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::wrappers::SignalStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Signals that abort startup or end the wait for a shutdown request
static SIGNALS: [SignalKind; 2] = [SignalKind::interrupt(), SignalKind::terminate()];

pub struct Signals {
    stream: Pin<Box<dyn Stream<Item = ()> + Send>>,
}

impl Signals {
    pub fn new() -> std::io::Result<Self> {
        let signal_streams = SIGNALS
            .iter()
            .map(|s| signal(*s).map(SignalStream::new))
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Signals {
            stream: Box::pin(select_all(signal_streams)),
        })
    }

    pub async fn next(&mut self) -> Option<()> {
        self.stream.next().await
    }

    /// Cancels `token` on the first SIGINT/SIGTERM.
    pub fn cancel_on_signal(mut self, token: CancellationToken) {
        tokio::spawn(async move {
            if self.next().await.is_some() {
                info!("Shutdown signal received");
                token.cancel();
            }
        });
    }
}
