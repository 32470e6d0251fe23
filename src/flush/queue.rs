//! # Flush queue
//!
//! Per-column-family queue keyed by commit-log replay position. Flush work
//! bodies run in parallel, but the post callbacks (commit-log segment
//! discards) fire strictly in replay-position order, so the log never
//! reclaims a segment while an earlier memtable is still in flight.

use crate::commitlog::ReplayPosition;
use crate::err::Error;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::Notify;

struct Inner {
    /// Pending work count per replay position
    pending: BTreeMap<ReplayPosition, usize>,
    closed: bool,
}

pub struct FlushQueue {
    inner: Mutex<Inner>,
    changed: Notify,
}

impl FlushQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: BTreeMap::new(),
                closed: false,
            }),
            changed: Notify::new(),
        }
    }

    /// Fails once the queue has been closed; new work must not start.
    pub fn check_open_gate(&self) -> Result<(), Error> {
        if self.inner.lock().expect("flush queue poisoned").closed {
            return Err(Error::FlushQueueClosed);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("flush queue poisoned")
            .pending
            .values()
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `work`, then `post(rp)` once every post for a smaller replay
    /// position has completed. Work bodies may overlap freely. A zero
    /// position adopts the current highest queued key: such flushes (from
    /// streaming) have no commit-log position but must still order.
    pub async fn run_cf_flush<W, P, PF>(
        &self,
        rp: ReplayPosition,
        work: W,
        post: P,
    ) -> Result<(), Error>
    where
        W: Future<Output = Result<(), Error>>,
        P: FnOnce(ReplayPosition) -> PF,
        PF: Future<Output = ()>,
    {
        let rp = {
            let mut inner = self.inner.lock().expect("flush queue poisoned");
            if inner.closed {
                return Err(Error::FlushQueueClosed);
            }
            let rp = if rp.is_zero() {
                inner
                    .pending
                    .keys()
                    .next_back()
                    .copied()
                    .unwrap_or(ReplayPosition::ZERO)
            } else {
                rp
            };
            *inner.pending.entry(rp).or_insert(0) += 1;
            rp
        };

        let result = work.await;

        // Barrier: posts for smaller positions must all have drained.
        loop {
            let waiter = self.changed.notified();
            tokio::pin!(waiter);
            waiter.as_mut().enable();
            {
                let inner = self.inner.lock().expect("flush queue poisoned");
                if inner.pending.range(..rp).next().is_none() {
                    break;
                }
            }
            waiter.await;
        }

        if result.is_ok() {
            post(rp).await;
        }

        {
            let mut inner = self.inner.lock().expect("flush queue poisoned");
            if let Some(count) = inner.pending.get_mut(&rp) {
                *count -= 1;
                if *count == 0 {
                    inner.pending.remove(&rp);
                }
            }
        }
        self.changed.notify_waiters();
        result
    }

    /// Closes the gate and waits until every pending post has run.
    pub async fn close(&self) {
        self.inner.lock().expect("flush queue poisoned").closed = true;
        loop {
            let waiter = self.changed.notified();
            tokio::pin!(waiter);
            waiter.as_mut().enable();
            if self.is_empty() {
                return;
            }
            waiter.await;
        }
    }
}

impl Default for FlushQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    fn rp(offset: u32) -> ReplayPosition {
        ReplayPosition::new(1, offset)
    }

    #[tokio::test]
    async fn posts_fire_in_replay_position_order() {
        let queue = Arc::new(FlushQueue::new());
        let order: Arc<AsyncMutex<Vec<u32>>> = Arc::new(AsyncMutex::new(Vec::new()));

        // Work bodies complete in the order 3, 1, 2; posts must still run
        // as 1, 2, 3.
        let mut handles = Vec::new();
        for (offset, delay_ms) in [(1u32, 120u64), (2, 180), (3, 20)] {
            let queue = Arc::clone(&queue);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                queue
                    .run_cf_flush(
                        rp(offset),
                        async move {
                            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                            Ok(())
                        },
                        |position| async move {
                            order.lock().await.push(position.offset);
                        },
                    )
                    .await
                    .unwrap();
            }));
            // Ensure each flush is enqueued before the next.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn zero_position_adopts_the_highest_queued_key() {
        let queue = Arc::new(FlushQueue::new());
        let order: Arc<AsyncMutex<Vec<(u32, u32)>>> = Arc::new(AsyncMutex::new(Vec::new()));

        let slow_queue = Arc::clone(&queue);
        let slow_order = Arc::clone(&order);
        let slow = tokio::spawn(async move {
            slow_queue
                .run_cf_flush(
                    rp(7),
                    async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(())
                    },
                    |position| async move {
                        slow_order.lock().await.push((7, position.offset));
                    },
                )
                .await
                .unwrap();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // A streaming flush with no commit-log position: must wait for rp 7.
        let zero_order = Arc::clone(&order);
        queue
            .run_cf_flush(ReplayPosition::ZERO, async { Ok(()) }, |position| async move {
                zero_order.lock().await.push((0, position.offset));
            })
            .await
            .unwrap();
        slow.await.unwrap();

        let recorded = order.lock().await;
        assert_eq!(recorded.len(), 2);
        // The adopted key equals the highest queued position.
        assert!(recorded.contains(&(0, 7)));
        assert!(recorded.contains(&(7, 7)));
    }

    #[tokio::test]
    async fn failed_work_skips_its_post() {
        let queue = FlushQueue::new();
        let result = queue
            .run_cf_flush(
                rp(1),
                async { Err(Error::CompactionFailed("boom".into())) },
                |_| async { panic!("post must not run for failed work") },
            )
            .await;
        assert!(result.is_err());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn close_waits_for_pending_posts_and_gates_new_work() {
        let queue = Arc::new(FlushQueue::new());
        let inner = Arc::clone(&queue);
        let pending = tokio::spawn(async move {
            inner
                .run_cf_flush(
                    rp(1),
                    async {
                        tokio::time::sleep(Duration::from_millis(80)).await;
                        Ok(())
                    },
                    |_| async {},
                )
                .await
                .unwrap();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close().await;
        assert!(queue.check_open_gate().is_err());
        pending.await.unwrap();

        let rejected = queue.run_cf_flush(rp(2), async { Ok(()) }, |_| async {}).await;
        assert!(matches!(rejected, Err(Error::FlushQueueClosed)));
    }
}
