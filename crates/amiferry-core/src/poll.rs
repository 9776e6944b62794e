//! Generic fixed-interval polling plus the copy completion poller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use amiferry_common::{AmiError, CloudProvider, CopyState, Result};
use tokio::time::sleep;
use tracing::{info, instrument};

use crate::copy::SnapshotPair;

/// Interval between progress checks on an in-flight copy.
pub const PROGRESS_POLL_INTERVAL: Duration = Duration::from_secs(20);

/// Runs `step` until it yields a value or an error, sleeping `interval`
/// between attempts. `Ok(None)` means "not there yet, try again".
pub async fn poll_until<T, F, Fut>(interval: Duration, mut step: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    loop {
        if let Some(value) = step().await? {
            return Ok(value);
        }
        sleep(interval).await;
    }
}

/// Polls recorded copy jobs in initiation order until each reaches a
/// terminal state, failing fast on the first job that reports an error.
#[derive(Clone)]
pub struct CompletionPoller {
    destination: Arc<dyn CloudProvider>,
}

impl CompletionPoller {
    pub fn new(destination: Arc<dyn CloudProvider>) -> Self {
        Self { destination }
    }

    #[instrument(skip_all, fields(jobs = pairs.len()))]
    pub async fn wait_all(&self, pairs: &[SnapshotPair]) -> Result<()> {
        for pair in pairs {
            self.wait_one(pair).await?;
        }
        Ok(())
    }

    async fn wait_one(&self, pair: &SnapshotPair) -> Result<()> {
        let destination = &self.destination;
        let snapshot_id = pair.destination_id.as_str();

        poll_until(PROGRESS_POLL_INTERVAL, move || async move {
            let progress = destination.snapshot_progress(snapshot_id).await?;
            match progress.state {
                CopyState::Error => {
                    let reason = progress
                        .message
                        .unwrap_or_else(|| "no state message".to_string());
                    Err(AmiError::CopyFailed(format!(
                        "snapshot {snapshot_id} entered error state: {reason}"
                    )))
                }
                CopyState::Completed => Ok(Some(())),
                CopyState::Pending if progress.percent >= 100 => Ok(Some(())),
                CopyState::Pending => {
                    info!(
                        snapshot = %snapshot_id,
                        progress = progress.percent,
                        "copy in progress"
                    );
                    Ok(None)
                }
            }
        })
        .await?;

        // Reported progress can race the provider's completion flag; one
        // blocking wait confirms the terminal state.
        self.destination.wait_snapshot_completed(snapshot_id).await?;
        info!(snapshot = %snapshot_id, source = %pair.source_id, "copy completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockCloud;
    use amiferry_common::CopyProgress;
    use mockall::Sequence;

    fn pair(source: &str, destination: &str) -> SnapshotPair {
        SnapshotPair {
            source_id: source.to_string(),
            destination_id: destination.to_string(),
        }
    }

    fn progress(percent: u8, state: CopyState) -> CopyProgress {
        CopyProgress {
            percent,
            state,
            message: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_full_progress_then_confirms() {
        let mut cloud = MockCloud::new();
        let mut seq = Sequence::new();
        cloud
            .expect_snapshot_progress()
            .withf(|id| id == "snap-dst")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(progress(37, CopyState::Pending)));
        cloud
            .expect_snapshot_progress()
            .withf(|id| id == "snap-dst")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(progress(100, CopyState::Pending)));
        cloud
            .expect_wait_snapshot_completed()
            .withf(|id| id == "snap-dst")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let poller = CompletionPoller::new(Arc::new(cloud));
        poller
            .wait_all(&[pair("snap-src", "snap-dst")])
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn completed_state_short_circuits_progress_percentage() {
        let mut cloud = MockCloud::new();
        cloud
            .expect_snapshot_progress()
            .times(1)
            .returning(|_| Ok(progress(99, CopyState::Completed)));
        cloud
            .expect_wait_snapshot_completed()
            .times(1)
            .returning(|_| Ok(()));

        let poller = CompletionPoller::new(Arc::new(cloud));
        poller.wait_all(&[pair("snap-a", "snap-b")]).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn error_state_fails_fast_and_skips_later_jobs() {
        let mut cloud = MockCloud::new();
        cloud
            .expect_snapshot_progress()
            .withf(|id| id == "snap-bad")
            .times(1)
            .returning(|_| {
                Ok(CopyProgress {
                    percent: 12,
                    state: CopyState::Error,
                    message: Some("source snapshot unusable".to_string()),
                })
            });
        // The second job must never be polled and no confirmation wait runs.
        cloud.expect_wait_snapshot_completed().never();

        let poller = CompletionPoller::new(Arc::new(cloud));
        let err = poller
            .wait_all(&[pair("snap-1", "snap-bad"), pair("snap-2", "snap-later")])
            .await
            .unwrap_err();
        match err {
            AmiError::CopyFailed(msg) => {
                assert!(msg.contains("snap-bad"), "message: {msg}");
                assert!(msg.contains("source snapshot unusable"));
            }
            other => panic!("expected CopyFailed, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_retries_on_none() {
        let mut remaining = 3u32;
        let value = poll_until(Duration::from_secs(20), || {
            let done = remaining == 0;
            if !done {
                remaining -= 1;
            }
            async move { Ok(if done { Some(42) } else { None }) }
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
    }
}
