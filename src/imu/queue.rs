//! Thread-safe inertial sample queue.
//!
//! The IMU producer pushes from its own thread; the tracking loop drains
//! everything up to the current frame timestamp.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::debug;

use super::sample::ImuSample;

#[derive(Debug, Default)]
struct QueueInner {
    pending: VecDeque<ImuSample>,
    /// Timestamp of the last drain; older samples are rejected.
    watermark: Option<f64>,
    dropped: usize,
}

#[derive(Debug, Default)]
pub struct ImuQueue {
    inner: Mutex<QueueInner>,
}

impl ImuQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample.
    ///
    /// Samples at or before the last drained timestamp are dropped. Late
    /// samples that are still newer than the watermark are inserted in order.
    pub fn push(&self, sample: ImuSample) {
        let mut inner = self.inner.lock();
        if let Some(mark) = inner.watermark {
            if sample.timestamp_s <= mark {
                inner.dropped += 1;
                debug!(
                    "Dropping stale IMU sample t={:.6} (drained up to {:.6})",
                    sample.timestamp_s, mark
                );
                return;
            }
        }

        let needs_sort = inner
            .pending
            .back()
            .is_some_and(|last| last.timestamp_s > sample.timestamp_s);
        if needs_sort {
            let idx = inner
                .pending
                .partition_point(|s| s.timestamp_s <= sample.timestamp_s);
            inner.pending.insert(idx, sample);
        } else {
            inner.pending.push_back(sample);
        }
    }

    /// Remove and return every sample with `timestamp <= t`, in time order.
    pub fn drain_until(&self, t: f64) -> Vec<ImuSample> {
        let mut inner = self.inner.lock();
        let n = inner.pending.partition_point(|s| s.timestamp_s <= t);
        let out: Vec<ImuSample> = inner.pending.drain(..n).collect();
        inner.watermark = Some(inner.watermark.map_or(t, |m| m.max(t)));
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }

    /// Number of samples rejected as out of order.
    pub fn dropped(&self) -> usize {
        self.inner.lock().dropped
    }

    /// Discard pending samples and forget the watermark.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.pending.clear();
        inner.watermark = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn s(t: f64) -> ImuSample {
        ImuSample::new(t, Vector3::zeros(), Vector3::zeros())
    }

    #[test]
    fn test_drain_until_is_inclusive() {
        let q = ImuQueue::new();
        for t in [0.1, 0.2, 0.3, 0.4] {
            q.push(s(t));
        }
        let out = q.drain_until(0.3);
        assert_eq!(out.len(), 3);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_stale_samples_are_dropped() {
        let q = ImuQueue::new();
        q.push(s(0.1));
        q.push(s(0.2));
        q.drain_until(0.2);
        q.push(s(0.15));
        q.push(s(0.25));
        assert_eq!(q.len(), 1);
        assert_eq!(q.dropped(), 1);
    }

    #[test]
    fn test_late_samples_inserted_in_order() {
        let q = ImuQueue::new();
        q.push(s(0.1));
        q.push(s(0.3));
        q.push(s(0.2));
        let out = q.drain_until(1.0);
        let ts: Vec<f64> = out.iter().map(|x| x.timestamp_s).collect();
        assert_eq!(ts, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_concurrent_producer() {
        use std::sync::Arc;
        let q = Arc::new(ImuQueue::new());
        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                for i in 0..100 {
                    q.push(s(i as f64 * 0.005));
                }
            })
        };
        producer.join().unwrap();
        assert_eq!(q.drain_until(10.0).len(), 100);
    }
}
