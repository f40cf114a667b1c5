//! Distribution of received application frames to interested callers.
//!
//! The bus driver pushes every kept `Request`/`Response`/`Event` frame into
//! the [`FrameDispatcher`], which routes it to the [`FrameBucket`]s whose
//! function id (and optionally source station) match. Buckets queue frames
//! behind a condition variable so a caller thread can block on
//! [`FrameBucket::wait_for_frame`] while the bus thread keeps running.

use log::debug;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::frame::{Command, CommandFrame};
use crate::types::Station;

/// A frame together with the token round it arrived in.
#[derive(Debug)]
pub struct ReceivedFrame {
    received_at_token: u32,
    frame: CommandFrame,
}

impl ReceivedFrame {
    pub(crate) fn new(frame: CommandFrame, received_at_token: u32) -> Self {
        Self {
            received_at_token,
            frame,
        }
    }

    pub fn frame(&self) -> &CommandFrame {
        &self.frame
    }

    /// Token count of the bus at the time the frame arrived.
    pub fn received_at_token(&self) -> u32 {
        self.received_at_token
    }
}

type Registry = Mutex<Vec<Weak<FrameBucket>>>;

/// Routes received frames to matching buckets.
#[derive(Clone)]
pub struct FrameDispatcher {
    buckets: Arc<Registry>,
}

impl Default for FrameDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDispatcher {
    pub fn new() -> Self {
        Self {
            buckets: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Offer a frame to every matching bucket. Frames that are not
    /// application traffic, or that nobody asked for, are dropped.
    pub fn collect(&self, frame: CommandFrame, at_token: u32) {
        match frame.command {
            Command::Request | Command::Response | Command::Event => {}
            other => {
                debug!("ds485: not distributing {} frame", other);
                return;
            }
        }
        let function_id = match frame.payload().dissector().read_u8() {
            Ok(id) => id,
            Err(_) => {
                debug!("ds485: not distributing frame without a function id");
                return;
            }
        };
        let source = frame.header.source;
        let received = Arc::new(ReceivedFrame::new(frame, at_token));

        let mut delivered = false;
        let mut buckets = lock(&self.buckets);
        // dead weak entries are pruned as a side effect
        buckets.retain(|entry| match entry.upgrade() {
            Some(bucket) => {
                if bucket.matches(function_id, source) {
                    delivered |= bucket.add_frame(received.clone());
                }
                true
            }
            None => false,
        });
        if !delivered {
            debug!(
                "ds485: no bucket for function id 0x{:02x} from {}",
                function_id, source
            );
        }
    }

    fn register(&self, bucket: &Arc<FrameBucket>) {
        let mut buckets = lock(&self.buckets);
        if buckets
            .iter()
            .any(|entry| entry.upgrade().map_or(false, |b| Arc::ptr_eq(&b, bucket)))
        {
            return;
        }
        buckets.push(Arc::downgrade(bucket));
    }
}

#[derive(Debug)]
struct BucketQueue {
    frames: VecDeque<Arc<ReceivedFrame>>,
    /// Accept only one frame, for single request/response exchanges.
    single: bool,
}

/// A filtered, waitable queue of received frames.
///
/// Dropping the bucket unregisters it from its dispatcher.
pub struct FrameBucket {
    registry: Weak<Registry>,
    function_id: u8,
    source: Option<Station>,
    queue: Mutex<BucketQueue>,
    frame_here: Condvar,
}

impl FrameBucket {
    /// Creates a bucket for `function_id` and registers it. A `source` of
    /// `None` accepts the function id from every station.
    pub fn new(
        dispatcher: &FrameDispatcher,
        function_id: u8,
        source: Option<Station>,
    ) -> Arc<Self> {
        let bucket = Arc::new(FrameBucket {
            registry: Arc::downgrade(&dispatcher.buckets),
            function_id,
            source,
            queue: Mutex::new(BucketQueue {
                frames: VecDeque::new(),
                single: false,
            }),
            frame_here: Condvar::new(),
        });
        debug!(
            "ds485: bucket for function id 0x{:02x} installed",
            function_id
        );
        dispatcher.register(&bucket);
        bucket
    }

    pub fn function_id(&self) -> u8 {
        self.function_id
    }

    pub fn source(&self) -> Option<Station> {
        self.source
    }

    fn matches(&self, function_id: u8, source: Station) -> bool {
        self.function_id == function_id && self.source.map_or(true, |s| s == source)
    }

    /// Queues a frame. Returns false if the bucket is in single-frame mode
    /// and already holds its answer.
    fn add_frame(&self, frame: Arc<ReceivedFrame>) -> bool {
        let mut queue = lock(&self.queue);
        if queue.single && !queue.frames.is_empty() {
            return false;
        }
        queue.frames.push_back(frame);
        self.frame_here.notify_one();
        true
    }

    /// Removes and returns the oldest queued frame.
    pub fn pop_frame(&self) -> Option<Arc<ReceivedFrame>> {
        lock(&self.queue).frames.pop_front()
    }

    /// Waits for a single matching frame. Any further matches are rejected
    /// until the frame is popped. Returns true if a frame is available.
    pub fn wait_for_frame(&self, timeout: Duration) -> bool {
        let mut queue = lock(&self.queue);
        queue.single = true;
        if queue.frames.is_empty() {
            let (guard, _) = self
                .frame_here
                .wait_timeout_while(queue, timeout, |q| q.frames.is_empty())
                .unwrap_or_else(|e| e.into_inner());
            queue = guard;
        }
        !queue.frames.is_empty()
    }

    /// Collects matching frames for the whole window.
    pub fn wait_for_frames(&self, window: Duration) {
        lock(&self.queue).single = false;
        std::thread::sleep(window);
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.queue).frames.is_empty()
    }

    pub fn frame_count(&self) -> usize {
        lock(&self.queue).frames.len()
    }
}

impl Drop for FrameBucket {
    fn drop(&mut self) {
        // Our own weak no longer upgrades at this point, so dispatch cannot
        // reach this bucket anymore. Pruning the registry slot is best
        // effort: the last handle may drop inside a dispatch that already
        // holds the registry lock, and the next dispatch prunes dead slots
        // anyway.
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut buckets) = registry.try_lock() {
                buckets.retain(|entry| entry.upgrade().is_some());
            }
        }
    }
}

/// Locks without tracking poisoning; a panicked bus thread must not take
/// the waiting callers down with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
