//! Drain scheduler
//!
//! One background task per track moves queued frames into the writer. Each
//! iteration asks the recorder task for a single drain pass and sleeps when
//! the pass made no progress, so a writer that reports "not ready" is polled
//! rather than blocked on.

use super::coordinator::Command;
use super::state::PipelineOptions;
use crate::media::TrackKind;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Sleep timings between passes
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub not_ready: Duration,
    pub idle: Duration,
}

impl From<&PipelineOptions> for Backoff {
    fn from(options: &PipelineOptions) -> Self {
        Self {
            not_ready: options.not_ready_backoff,
            idle: options.idle_backoff,
        }
    }
}

/// Drain `kind` until the session says stop or the recorder goes away.
///
/// The loop only holds a weak handle on the command channel; once every
/// `Recorder` is dropped the upgrade fails and the loop exits.
pub(crate) async fn run_drain_loop(
    kind: TrackKind,
    generation: u64,
    commands: mpsc::WeakSender<Command>,
    backoff: Backoff,
) {
    let mut written_total = 0u64;
    loop {
        let Some(tx) = commands.upgrade() else {
            break;
        };
        let (reply, rx) = oneshot::channel();
        let sent = tx
            .send(Command::DrainPass {
                kind,
                generation,
                reply,
            })
            .await;
        drop(tx);
        if sent.is_err() {
            break;
        }
        let Ok(pass) = rx.await else {
            break;
        };

        written_total += pass.written as u64;
        if !pass.keep_draining {
            break;
        }

        if pass.not_ready {
            tokio::time::sleep(backoff.not_ready).await;
        } else if pass.remaining == 0 {
            tokio::time::sleep(backoff.idle).await;
        } else {
            tokio::task::yield_now().await;
        }
    }
    tracing::debug!(
        "{} drain loop for generation {} exited after {} frames",
        kind,
        generation,
        written_total
    );
}
