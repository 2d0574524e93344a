//! [`MetadataSyncer`] – pairs two strictly increasing keyed streams.
//!
//! # Algorithm
//!
//! Both sides are queued in arrival order. After every enqueue the oldest
//! sample (key `k`) is compared against the oldest metadata:
//!
//! | Oldest metadata | Action |
//! |---|---|
//! | key < `k` | stale, can never match: dropped through `on_metadata_dropped` |
//! | key == `k` | both popped and delivered through `on_pair_ready` |
//! | key > `k`, or none | wait for more input |
//!
//! A sample pushed out of a full sample queue is delivered with no metadata
//! instead of being lost. Metadata pushed out of a full metadata queue is
//! dropped through `on_metadata_dropped`.
//!
//! # Delivery
//!
//! Every decision is made under the internal lock and appended to a ready
//! queue, so the ready queue is always in key order. Only one caller at a
//! time delivers from it, with the lock released around each callback. A
//! caller that finds a delivery already running leaves its events to that
//! caller and returns, which also makes callbacks free to enqueue into the
//! same syncer.
//!
//! A failing `on_pair_ready` does not stop delivery. The first error is
//! returned from the call that was delivering when it happened.
//!
//! # Example
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use devcast_sync::MetadataSyncer;
//!
//! let keys = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&keys);
//! let syncer: MetadataSyncer<&str, &str> = MetadataSyncer::new(10, 10).on_pair_ready(move |pair| {
//!     sink.lock().unwrap().push((pair.key, pair.metadata.is_some()));
//!     Ok(())
//! });
//!
//! syncer.enqueue_sample(1, "frame-1").unwrap();
//! syncer.enqueue_metadata(1, "md-1").unwrap();
//! assert_eq!(*keys.lock().unwrap(), vec![(1, true)]);
//! ```

use std::collections::VecDeque;

use devcast_types::DevcastError;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

/// Default number of samples held while waiting for metadata.
pub const DEFAULT_MAX_SAMPLE_QUEUE_SIZE: usize = 8;

/// Default number of metadata records held while waiting for samples.
pub const DEFAULT_MAX_METADATA_QUEUE_SIZE: usize = 8;

/// A sample and the metadata that shares its key, if any arrived in time.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPair<S, M> {
    pub key: u64,
    pub sample: S,
    pub metadata: Option<M>,
}

type PairCallback<S, M> = Box<dyn Fn(MatchedPair<S, M>) -> Result<(), DevcastError> + Send + Sync>;
type DroppedCallback<M> = Box<dyn Fn(u64, M) + Send + Sync>;

enum Event<S, M> {
    Pair(MatchedPair<S, M>),
    Dropped(u64, M),
}

struct Queues<S, M> {
    samples: VecDeque<(u64, S)>,
    metadata: VecDeque<(u64, M)>,
    ready: VecDeque<Event<S, M>>,
    draining: bool,
    last_sample_key: Option<u64>,
    last_metadata_key: Option<u64>,
}

impl<S, M> Queues<S, M> {
    fn release_sample(&mut self, key: u64, sample: S) {
        self.ready.push_back(Event::Pair(MatchedPair { key, sample, metadata: None }));
    }

    /// Match the oldest sample against the oldest metadata until one side
    /// runs dry or the metadata is ahead.
    fn match_front(&mut self) {
        loop {
            let (Some(&(sample_key, _)), Some(&(metadata_key, _))) =
                (self.samples.front(), self.metadata.front())
            else {
                return;
            };
            if metadata_key > sample_key {
                return;
            }
            let Some((metadata_key, metadata)) = self.metadata.pop_front() else {
                return;
            };
            if metadata_key < sample_key {
                self.ready.push_back(Event::Dropped(metadata_key, metadata));
                continue;
            }
            let Some((key, sample)) = self.samples.pop_front() else {
                return;
            };
            self.ready.push_back(Event::Pair(MatchedPair { key, sample, metadata: Some(metadata) }));
        }
    }
}

/// Pairs samples with metadata by key. See the [module docs](self).
pub struct MetadataSyncer<S, M> {
    max_sample_queue_size: usize,
    max_metadata_queue_size: usize,
    queues: Mutex<Queues<S, M>>,
    on_pair_ready: Option<PairCallback<S, M>>,
    on_metadata_dropped: Option<DroppedCallback<M>>,
}

impl<S, M> MetadataSyncer<S, M> {
    /// Create a syncer with the given queue capacities (each at least 1).
    pub fn new(max_sample_queue_size: usize, max_metadata_queue_size: usize) -> Self {
        Self {
            max_sample_queue_size: max_sample_queue_size.max(1),
            max_metadata_queue_size: max_metadata_queue_size.max(1),
            queues: Mutex::new(Queues {
                samples: VecDeque::with_capacity(max_sample_queue_size.max(1) + 1),
                metadata: VecDeque::with_capacity(max_metadata_queue_size.max(1) + 1),
                ready: VecDeque::new(),
                draining: false,
                last_sample_key: None,
                last_metadata_key: None,
            }),
            on_pair_ready: None,
            on_metadata_dropped: None,
        }
    }

    /// Set the callback receiving every matched (or metadata-less) sample.
    pub fn on_pair_ready(
        mut self,
        callback: impl Fn(MatchedPair<S, M>) -> Result<(), DevcastError> + Send + Sync + 'static,
    ) -> Self {
        self.on_pair_ready = Some(Box::new(callback));
        self
    }

    /// Set the callback receiving metadata that will never be matched.
    pub fn on_metadata_dropped(mut self, callback: impl Fn(u64, M) + Send + Sync + 'static) -> Self {
        self.on_metadata_dropped = Some(Box::new(callback));
        self
    }

    pub fn max_sample_queue_size(&self) -> usize {
        self.max_sample_queue_size
    }

    pub fn max_metadata_queue_size(&self) -> usize {
        self.max_metadata_queue_size
    }

    /// Number of `(samples, metadata)` currently queued.
    pub fn queued(&self) -> (usize, usize) {
        let queues = self.queues.lock();
        (queues.samples.len(), queues.metadata.len())
    }

    /// Queue a sample and try to match it.
    ///
    /// # Errors
    ///
    /// [`DevcastError::OutOfOrder`] when `key` is not greater than the
    /// previously enqueued sample key. Nothing is queued in that case.
    /// Otherwise the first error returned by `on_pair_ready` while this call
    /// was delivering; the sample itself is accepted either way.
    pub fn enqueue_sample(&self, key: u64, sample: S) -> Result<(), DevcastError> {
        {
            let mut queues = self.queues.lock();
            check_order("sample", key, queues.last_sample_key)?;
            queues.last_sample_key = Some(key);
            queues.samples.push_back((key, sample));
            if queues.samples.len() > self.max_sample_queue_size {
                if let Some((old_key, old_sample)) = queues.samples.pop_front() {
                    debug!(key = old_key, "sample queue full; releasing oldest sample without metadata");
                    queues.release_sample(old_key, old_sample);
                }
            }
            queues.match_front();
        }
        self.drain()
    }

    /// Queue a metadata record and try to match it.
    ///
    /// # Errors
    ///
    /// Same contract as [`enqueue_sample`](Self::enqueue_sample), checked
    /// against the previously enqueued metadata key.
    pub fn enqueue_metadata(&self, key: u64, metadata: M) -> Result<(), DevcastError> {
        {
            let mut queues = self.queues.lock();
            check_order("metadata", key, queues.last_metadata_key)?;
            queues.last_metadata_key = Some(key);
            queues.metadata.push_back((key, metadata));
            if queues.metadata.len() > self.max_metadata_queue_size {
                if let Some((old_key, old_metadata)) = queues.metadata.pop_front() {
                    debug!(key = old_key, "metadata queue full; dropping oldest metadata");
                    queues.ready.push_back(Event::Dropped(old_key, old_metadata));
                }
            }
            queues.match_front();
        }
        self.drain()
    }

    /// Release every queued sample, oldest first.
    ///
    /// Each sample still gets matched against queued metadata when possible;
    /// the rest go out without metadata. Leftover metadata is then dropped.
    /// If another caller is delivering, the released events go out on that
    /// caller before it returns.
    pub fn flush(&self) -> Result<(), DevcastError> {
        {
            let mut guard = self.queues.lock();
            let queues = &mut *guard;
            while let Some((key, sample)) = queues.samples.pop_front() {
                queues.release_sample(key, sample);
                queues.match_front();
            }
            queues
                .ready
                .extend(queues.metadata.drain(..).map(|(key, metadata)| Event::Dropped(key, metadata)));
        }
        self.drain()
    }

    /// Discard both queues, and anything not yet delivered, without invoking
    /// any callback.
    ///
    /// The ordering history is reset too, so a restarted stream may begin
    /// its keys anew.
    pub fn clear(&self) {
        let mut queues = self.queues.lock();
        queues.samples.clear();
        queues.metadata.clear();
        queues.ready.clear();
        queues.last_sample_key = None;
        queues.last_metadata_key = None;
    }

    /// Deliver ready events until none are left, unless another caller is
    /// already doing so.
    fn drain(&self) -> Result<(), DevcastError> {
        {
            let mut queues = self.queues.lock();
            if queues.draining {
                return Ok(());
            }
            queues.draining = true;
        }

        let mut first_error = None;
        loop {
            let next = {
                let mut queues = self.queues.lock();
                let next = queues.ready.pop_front();
                if next.is_none() {
                    queues.draining = false;
                }
                next
            };
            let Some(event) = next else { break };
            if let Err(e) = self.deliver(event) {
                match first_error {
                    None => first_error = Some(e),
                    Some(_) => warn!(error = %e, "further pair delivery failure"),
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn deliver(&self, event: Event<S, M>) -> Result<(), DevcastError> {
        match event {
            Event::Pair(pair) => match &self.on_pair_ready {
                Some(callback) => callback(pair),
                None => Ok(()),
            },
            Event::Dropped(key, metadata) => {
                if let Some(callback) = &self.on_metadata_dropped {
                    callback(key, metadata);
                }
                Ok(())
            }
        }
    }
}

fn check_order(queue: &str, key: u64, last: Option<u64>) -> Result<(), DevcastError> {
    match last {
        Some(last) if key <= last => {
            error!(queue, key, last, "out-of-order enqueue; producer ordering bug");
            Err(DevcastError::OutOfOrder {
                queue: queue.to_string(),
                key,
                last,
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    type Pairs = Arc<Mutex<Vec<(u64, u64, Option<String>)>>>;
    type Dropped = Arc<Mutex<Vec<u64>>>;

    /// Syncer over `(sample_key_copy, metadata_text)` recording every event.
    fn recording_syncer(max_samples: usize, max_metadata: usize) -> (Arc<MetadataSyncer<u64, String>>, Pairs, Dropped) {
        let pairs: Pairs = Arc::new(Mutex::new(Vec::new()));
        let dropped: Dropped = Arc::new(Mutex::new(Vec::new()));
        let pair_sink = Arc::clone(&pairs);
        let drop_sink = Arc::clone(&dropped);
        let syncer = MetadataSyncer::new(max_samples, max_metadata)
            .on_pair_ready(move |pair: MatchedPair<u64, String>| {
                pair_sink.lock().push((pair.key, pair.sample, pair.metadata));
                Ok(())
            })
            .on_metadata_dropped(move |key, _| drop_sink.lock().push(key));
        (Arc::new(syncer), pairs, dropped)
    }

    fn md(key: u64) -> String {
        format!("md-{key}")
    }

    #[test]
    fn sample_then_metadata_matches() {
        let (syncer, pairs, _) = recording_syncer(10, 10);
        syncer.enqueue_sample(1, 1).unwrap();
        assert!(pairs.lock().is_empty());
        syncer.enqueue_metadata(1, md(1)).unwrap();
        assert_eq!(*pairs.lock(), vec![(1, 1, Some(md(1)))]);
        assert_eq!(syncer.queued(), (0, 0));
    }

    #[test]
    fn metadata_then_sample_matches() {
        let (syncer, pairs, _) = recording_syncer(10, 10);
        syncer.enqueue_metadata(4, md(4)).unwrap();
        syncer.enqueue_sample(4, 4).unwrap();
        assert_eq!(*pairs.lock(), vec![(4, 4, Some(md(4)))]);
    }

    #[test]
    fn stale_metadata_is_dropped() {
        let (syncer, pairs, dropped) = recording_syncer(10, 10);
        syncer.enqueue_metadata(1, md(1)).unwrap();
        syncer.enqueue_metadata(2, md(2)).unwrap();
        syncer.enqueue_sample(2, 2).unwrap();
        assert_eq!(*dropped.lock(), vec![1]);
        assert_eq!(*pairs.lock(), vec![(2, 2, Some(md(2)))]);
    }

    #[test]
    fn sample_waits_while_newer_metadata_is_queued() {
        let (syncer, pairs, _) = recording_syncer(10, 10);
        syncer.enqueue_sample(1, 1).unwrap();
        syncer.enqueue_metadata(2, md(2)).unwrap();
        assert!(pairs.lock().is_empty());
        assert_eq!(syncer.queued(), (1, 1));
    }

    #[test]
    fn out_of_order_sample_is_rejected_and_first_stays_queued() {
        let (syncer, _, _) = recording_syncer(10, 10);
        syncer.enqueue_sample(5, 5).unwrap();
        let err = syncer.enqueue_sample(3, 3).unwrap_err();
        assert_eq!(
            err,
            DevcastError::OutOfOrder { queue: "sample".to_string(), key: 3, last: 5 }
        );
        assert_eq!(syncer.queued(), (1, 0));
    }

    #[test]
    fn repeated_metadata_key_is_rejected() {
        let (syncer, _, _) = recording_syncer(10, 10);
        syncer.enqueue_metadata(2, md(2)).unwrap();
        assert!(matches!(
            syncer.enqueue_metadata(2, md(2)),
            Err(DevcastError::OutOfOrder { .. })
        ));
        assert_eq!(syncer.queued(), (0, 1));
    }

    #[test]
    fn eviction_releases_every_sample_without_metadata_in_order() {
        let max = 4;
        let (syncer, pairs, _) = recording_syncer(max, 10);
        for key in 1..=(max as u64 + 1) {
            syncer.enqueue_sample(key, key).unwrap();
        }
        // Only the overflowing sample has been pushed out so far.
        assert_eq!(*pairs.lock(), vec![(1, 1, None)]);

        syncer.flush().unwrap();
        let pairs = pairs.lock();
        assert_eq!(pairs.len(), max + 1);
        assert!(pairs.iter().all(|(_, _, metadata)| metadata.is_none()));
        let keys: Vec<u64> = pairs.iter().map(|(k, _, _)| *k).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn metadata_overflow_drops_oldest() {
        let (syncer, _, dropped) = recording_syncer(10, 2);
        for key in 1..=3 {
            syncer.enqueue_metadata(key, md(key)).unwrap();
        }
        assert_eq!(*dropped.lock(), vec![1]);
        assert_eq!(syncer.queued(), (0, 2));
    }

    #[test]
    fn metadata_arriving_within_capacity_is_never_lost() {
        let (syncer, pairs, _) = recording_syncer(3, 10);
        syncer.enqueue_sample(1, 1).unwrap();
        syncer.enqueue_sample(2, 2).unwrap();
        syncer.enqueue_metadata(1, md(1)).unwrap();
        syncer.enqueue_sample(3, 3).unwrap();
        syncer.enqueue_metadata(2, md(2)).unwrap();
        assert_eq!(
            *pairs.lock(),
            vec![(1, 1, Some(md(1))), (2, 2, Some(md(2)))]
        );
    }

    #[test]
    fn missing_first_metadata_scenario() {
        let (syncer, pairs, dropped) = recording_syncer(10, 10);
        for key in 1..=3 {
            syncer.enqueue_sample(key, key).unwrap();
        }
        syncer.enqueue_metadata(2, md(2)).unwrap();
        syncer.enqueue_metadata(3, md(3)).unwrap();
        assert!(pairs.lock().is_empty(), "sample 1 holds the queue until released");

        syncer.flush().unwrap();
        assert_eq!(
            *pairs.lock(),
            vec![(1, 1, None), (2, 2, Some(md(2))), (3, 3, Some(md(3)))]
        );
        assert!(dropped.lock().is_empty());
    }

    #[test]
    fn interleaved_enqueues_deliver_in_sample_key_order() {
        let (syncer, pairs, _) = recording_syncer(3, 3);
        // Metadata only for even keys, arriving in bursts.
        let mut next_md = 2;
        for key in 1..=20u64 {
            syncer.enqueue_sample(key, key).unwrap();
            if key % 3 == 0 {
                while next_md <= key {
                    syncer.enqueue_metadata(next_md, md(next_md)).unwrap();
                    next_md += 2;
                }
            }
        }
        syncer.flush().unwrap();
        let keys: Vec<u64> = pairs.lock().iter().map(|(k, _, _)| *k).collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
        assert_eq!(keys.len(), 20);
    }

    #[test]
    fn flush_drops_unmatched_metadata() {
        let (syncer, pairs, dropped) = recording_syncer(10, 10);
        syncer.enqueue_metadata(7, md(7)).unwrap();
        syncer.enqueue_metadata(8, md(8)).unwrap();
        syncer.flush().unwrap();
        assert!(pairs.lock().is_empty());
        assert_eq!(*dropped.lock(), vec![7, 8]);
    }

    #[test]
    fn clear_discards_silently_and_resets_ordering() {
        let (syncer, pairs, dropped) = recording_syncer(10, 10);
        syncer.enqueue_sample(10, 10).unwrap();
        syncer.enqueue_metadata(11, md(11)).unwrap();
        syncer.clear();
        assert_eq!(syncer.queued(), (0, 0));
        assert!(pairs.lock().is_empty());
        assert!(dropped.lock().is_empty());
        // Keys may start over after a clear.
        syncer.enqueue_sample(1, 1).unwrap();
        syncer.enqueue_metadata(1, md(1)).unwrap();
        assert_eq!(pairs.lock().len(), 1);
    }

    #[test]
    fn callback_may_reenter_the_syncer() {
        let slot: Arc<Mutex<Option<Arc<MetadataSyncer<u64, String>>>>> = Arc::new(Mutex::new(None));
        let delivered = Arc::new(Mutex::new(Vec::new()));

        let slot_in_cb = Arc::clone(&slot);
        let delivered_in_cb = Arc::clone(&delivered);
        let syncer = Arc::new(MetadataSyncer::new(10, 10).on_pair_ready(
            move |pair: MatchedPair<u64, String>| {
                delivered_in_cb.lock().push(pair.key);
                // Each delivered sample produces the metadata for the next one.
                let me = slot_in_cb.lock().clone();
                if let Some(me) = me {
                    if pair.key < 3 {
                        me.enqueue_metadata(pair.key + 1, md(pair.key + 1)).unwrap();
                    }
                }
                Ok(())
            },
        ));
        *slot.lock() = Some(Arc::clone(&syncer));

        syncer.enqueue_sample(1, 1).unwrap();
        syncer.enqueue_sample(2, 2).unwrap();
        syncer.enqueue_sample(3, 3).unwrap();
        syncer.enqueue_metadata(1, md(1)).unwrap();

        assert_eq!(*delivered.lock(), vec![1, 2, 3]);
        assert_eq!(syncer.queued(), (0, 0));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let syncer: MetadataSyncer<u8, u8> = MetadataSyncer::new(0, 0);
        assert_eq!(syncer.max_sample_queue_size(), 1);
        assert_eq!(syncer.max_metadata_queue_size(), 1);
    }

    #[test]
    fn concurrent_producers_for_both_queues() {
        let (syncer, pairs, _) = recording_syncer(1000, 1000);
        let samples = {
            let syncer = Arc::clone(&syncer);
            std::thread::spawn(move || {
                for key in 1..=200u64 {
                    syncer.enqueue_sample(key, key).unwrap();
                }
            })
        };
        let metadata = {
            let syncer = Arc::clone(&syncer);
            std::thread::spawn(move || {
                for key in 1..=200u64 {
                    syncer.enqueue_metadata(key, md(key)).unwrap();
                }
            })
        };
        samples.join().unwrap();
        metadata.join().unwrap();
        syncer.flush().unwrap();

        let pairs = pairs.lock();
        assert_eq!(pairs.len(), 200);
        assert!(pairs.iter().all(|(_, _, metadata)| metadata.is_some()));
        assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0), "pairs out of key order");
    }

    #[test]
    fn two_producer_threads_with_small_queues_keep_key_order() {
        for round in 0..50 {
            let delivered: Dropped = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&delivered);
            let syncer = Arc::new(MetadataSyncer::new(4, 4).on_pair_ready(
                move |pair: MatchedPair<u64, String>| {
                    sink.lock().push(pair.key);
                    // Widen the window between taking a pair and recording it.
                    std::thread::yield_now();
                    Ok(())
                },
            ));

            let samples = {
                let syncer = Arc::clone(&syncer);
                std::thread::spawn(move || {
                    for key in 1..=500u64 {
                        syncer.enqueue_sample(key, key).unwrap();
                    }
                })
            };
            let metadata = {
                let syncer = Arc::clone(&syncer);
                std::thread::spawn(move || {
                    for key in 1..=500u64 {
                        syncer.enqueue_metadata(key, md(key)).unwrap();
                    }
                })
            };
            samples.join().unwrap();
            metadata.join().unwrap();
            syncer.flush().unwrap();

            let keys = delivered.lock();
            assert_eq!(keys.len(), 500, "round {round}: every sample is delivered once");
            assert!(
                keys.windows(2).all(|w| w[0] < w[1]),
                "round {round}: pairs out of key order"
            );
        }
    }

    #[test]
    fn delivery_error_goes_to_the_delivering_call_and_delivery_continues() {
        let delivered: Dropped = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let syncer = MetadataSyncer::new(10, 10).on_pair_ready(move |pair: MatchedPair<u64, String>| {
            sink.lock().push(pair.key);
            if pair.key == 2 {
                return Err(DevcastError::Transport {
                    topic: "frames".to_string(),
                    details: "offline".to_string(),
                });
            }
            Ok(())
        });

        syncer.enqueue_sample(1, 1).unwrap();
        syncer.enqueue_sample(2, 2).unwrap();
        syncer.enqueue_sample(3, 3).unwrap();
        syncer.enqueue_metadata(1, md(1)).unwrap();
        assert!(matches!(syncer.flush(), Err(DevcastError::Transport { .. })));

        // Key 2 failed, key 3 still went out in the same pass.
        assert_eq!(*delivered.lock(), vec![1, 2, 3]);
        // The failure is reported once.
        syncer.enqueue_sample(4, 4).unwrap();
        syncer.flush().unwrap();
        assert_eq!(delivered.lock().len(), 4);
    }
}
