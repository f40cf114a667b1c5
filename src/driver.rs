//! Runs a [`BusController`] against a real line on a dedicated thread.
//!
//! [`BusDriver::start`] spawns the bus thread; the returned [`BusHandle`] is
//! the application's way in: queue frames, install buckets, watch the
//! controller state. The thread itself is deliberately dumb. It performs
//! whatever [`Poll`] directive the machine hands out, feeds the outcome back
//! in as a [`BusEvent`] and executes the resulting actions.

use log::{debug, error, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::controller::{Action, BusController, BusEvent, Config, ControllerState, Poll};
use crate::dispatch::{lock, FrameBucket, FrameDispatcher, ReceivedFrame};
use crate::frame::{CommandFrame, FrameOrigin};
use crate::reader::{FrameReader, ReaderStats};
use crate::transport::{self, Transport};
use crate::wire;

struct Shared {
    terminate: AtomicBool,
    state: Mutex<ControllerState>,
    token_count: AtomicU32,
    pending: AtomicUsize,
    outbox: Mutex<VecDeque<CommandFrame>>,
}

/// Owns the line, the frame reader and the controller until
/// [`start`](Self::start) moves them onto the bus thread.
pub struct BusDriver<T> {
    line: T,
    reader: FrameReader,
    machine: BusController,
    dispatcher: FrameDispatcher,
    shared: Arc<Shared>,
}

impl<T: Transport + Send + 'static> BusDriver<T> {
    pub fn new(line: T, config: Config) -> Self {
        let machine = BusController::new(config);
        let shared = Arc::new(Shared {
            terminate: AtomicBool::new(false),
            state: Mutex::new(machine.state()),
            token_count: AtomicU32::new(0),
            pending: AtomicUsize::new(0),
            outbox: Mutex::new(VecDeque::new()),
        });
        BusDriver {
            line,
            reader: FrameReader::new(),
            machine,
            dispatcher: FrameDispatcher::new(),
            shared,
        }
    }

    /// Spawns the bus thread and returns the handle for talking to it.
    pub fn start(self) -> std::io::Result<BusHandle> {
        let shared = self.shared.clone();
        let dispatcher = self.dispatcher.clone();
        let stats = self.reader.stats();
        let thread = thread::Builder::new()
            .name("ds485-bus".into())
            .spawn(move || self.run())?;
        Ok(BusHandle {
            shared,
            dispatcher,
            stats,
            thread,
        })
    }

    fn run(self) {
        let BusDriver {
            mut line,
            mut reader,
            mut machine,
            dispatcher,
            shared,
        } = self;

        if let Err(e) = line.reset() {
            error!("ds485: failed to open the line: {}", e);
            machine = machine.fail();
            publish(&shared, &machine);
            return;
        }

        while !shared.terminate.load(Ordering::Relaxed) {
            // frames queued by callers enter the machine first
            loop {
                let frame = lock(&shared.outbox).pop_front();
                match frame {
                    Some(frame) => {
                        machine = advance(
                            machine,
                            BusEvent::Enqueue(frame),
                            &mut line,
                            &dispatcher,
                            &shared,
                        );
                    }
                    None => break,
                }
            }

            let event = match machine.poll(Instant::now()) {
                Poll::Sleep(pause) => {
                    thread::sleep(pause);
                    BusEvent::Idle
                }
                Poll::Sense(window) => match transport::sense_traffic(&mut line, window) {
                    Ok(true) => BusEvent::Traffic,
                    Ok(false) => BusEvent::Idle,
                    Err(e) => {
                        error!("ds485: sense failed: {}", e);
                        BusEvent::LinkError
                    }
                },
                Poll::Read(window) => match reader.get_frame(&mut line, window) {
                    Ok(Some(frame)) => BusEvent::Frame(frame),
                    Ok(None) => BusEvent::Idle,
                    Err(e) => {
                        error!("ds485: read failed: {}", e);
                        BusEvent::LinkError
                    }
                },
                Poll::Reconnect(after) => {
                    thread::sleep(after);
                    reader.restart();
                    match line.reset() {
                        Ok(()) => BusEvent::LinkUp,
                        Err(e) => {
                            error!("ds485: reopen failed: {}", e);
                            BusEvent::LinkError
                        }
                    }
                }
                Poll::Halt => break,
            };
            machine = advance(machine, event, &mut line, &dispatcher, &shared);
        }
    }
}

fn advance<T: Transport>(
    machine: BusController,
    event: BusEvent,
    line: &mut T,
    dispatcher: &FrameDispatcher,
    shared: &Arc<Shared>,
) -> BusController {
    let (mut machine, actions) = machine.step(event, Instant::now());
    for action in actions {
        match action {
            Action::Send(frame) => {
                if let Err(e) = wire::put_frame(line, &frame) {
                    error!("ds485: write failed: {}", e);
                    machine = advance(machine, BusEvent::LinkError, line, dispatcher, shared);
                    break;
                }
            }
            Action::Deliver(frame) => dispatcher.collect(frame, machine.token_count()),
        }
    }
    publish(shared, &machine);
    machine
}

fn publish(shared: &Arc<Shared>, machine: &BusController) {
    shared
        .token_count
        .store(machine.token_count(), Ordering::Relaxed);
    shared
        .pending
        .store(machine.pending_frames(), Ordering::Relaxed);
    *lock(&shared.state) = machine.state();
}

/// The application's handle to a running bus.
pub struct BusHandle {
    shared: Arc<Shared>,
    dispatcher: FrameDispatcher,
    stats: Arc<ReaderStats>,
    thread: JoinHandle<()>,
}

impl BusHandle {
    pub fn state(&self) -> ControllerState {
        *lock(&self.shared.state)
    }

    pub fn state_name(&self) -> &'static str {
        self.state().name()
    }

    /// Tokens seen since the ring was joined.
    pub fn token_count(&self) -> u32 {
        self.shared.token_count.load(Ordering::Relaxed)
    }

    /// Frames queued for transmission and not yet sent, the caller-side
    /// queue included.
    pub fn pending_frames(&self) -> usize {
        lock(&self.shared.outbox).len() + self.shared.pending.load(Ordering::Relaxed)
    }

    /// Frame reader diagnostics.
    pub fn stats(&self) -> &ReaderStats {
        &self.stats
    }

    pub fn dispatcher(&self) -> &FrameDispatcher {
        &self.dispatcher
    }

    /// Queues a frame for transmission regardless of ring membership.
    pub fn enqueue_frame(&self, frame: CommandFrame) {
        lock(&self.shared.outbox).push_back(frame);
    }

    /// Queues a frame for transmission if the station holds a ring position,
    /// and loops it back to local buckets either way. The source station is
    /// stamped when the frame goes out.
    pub fn send_frame(&self, mut frame: CommandFrame) {
        frame.set_origin(FrameOrigin::Local);
        let loopback = frame.clone();
        if matches!(
            self.state(),
            ControllerState::Slave | ControllerState::Master
        ) {
            lock(&self.shared.outbox).push_back(frame);
        } else {
            debug!(
                "ds485: not on the ring, dropping frame for {}",
                frame.header.destination
            );
        }
        self.dispatcher.collect(loopback, self.token_count());
    }

    /// Sends a request and installs a bucket for its answers before the
    /// frame can hit the wire.
    pub fn send_and_install_bucket(
        &self,
        frame: CommandFrame,
        function_id: u8,
    ) -> Arc<FrameBucket> {
        let source = if frame.header.broadcast {
            None
        } else {
            Some(frame.header.destination)
        };
        let bucket = FrameBucket::new(&self.dispatcher, function_id, source);
        self.send_frame(frame);
        bucket
    }

    /// Sends a request and waits for its single answer.
    pub fn receive_single_frame(
        &self,
        frame: CommandFrame,
        function_id: u8,
        timeout: Duration,
    ) -> Option<Arc<ReceivedFrame>> {
        let bucket = self.send_and_install_bucket(frame, function_id);
        if !bucket.wait_for_frame(timeout) {
            debug!("ds485: no answer for function id 0x{:02x}", function_id);
            return None;
        }
        if bucket.frame_count() > 1 {
            warn!("ds485: multiple answers for function id 0x{:02x}", function_id);
        }
        bucket.pop_frame()
    }

    /// Asks the bus thread to stop after its current poll window.
    pub fn terminate(&self) {
        self.shared.terminate.store(true, Ordering::Relaxed);
    }

    /// Stops the bus thread and waits for it to exit.
    pub fn shutdown(self) {
        self.terminate();
        let _ = self.thread.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Error as TransportError;
    use snafu::ResultExt;
    use std::io;

    struct DeadLine;

    impl Transport for DeadLine {
        fn reset(&mut self) -> Result<(), TransportError> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such device"))
                .context(crate::transport::OpenSnafu)
        }

        fn read_byte(&mut self, _timeout: Duration) -> Result<Option<u8>, TransportError> {
            Ok(None)
        }

        fn write_byte(&mut self, _byte: u8) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[test]
    fn unopenable_line_halts_the_bus() {
        let config = Config::new(crate::types::DeviceId::new(1, 2));
        let handle = BusDriver::new(DeadLine, config).start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.state() != ControllerState::Error {
            assert!(Instant::now() < deadline, "bus did not halt");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.state_name(), "error");
        assert_eq!(handle.token_count(), 0);
        handle.shutdown();
    }

    #[test]
    fn pending_count_covers_the_caller_queue() {
        let config = Config::new(crate::types::DeviceId::new(1, 2));
        let handle = BusDriver::new(DeadLine, config).start().unwrap();
        assert_eq!(handle.pending_frames(), 0);

        let frame = crate::frame::CommandFrame::new(
            crate::types::station(5),
            crate::types::station(0),
            crate::frame::Command::Request,
        );
        handle.enqueue_frame(frame.clone());
        handle.enqueue_frame(frame);
        assert_eq!(handle.pending_frames(), 2);
        handle.shutdown();
    }

    #[test]
    fn send_frame_is_gated_but_loops_back() {
        let config = Config::new(crate::types::DeviceId::new(1, 2));
        let driver = BusDriver::new(DeadLine, config);
        let handle = driver.start().unwrap();

        let bucket = FrameBucket::new(handle.dispatcher(), 0x99, None);
        let mut frame = crate::frame::CommandFrame::broadcast(
            crate::types::station(0),
            crate::frame::Command::Request,
        );
        frame.payload_mut().add_u8(0x99).unwrap();
        handle.send_frame(frame);

        // not on the ring: nothing queued, but local handlers saw it
        assert_eq!(bucket.frame_count(), 1);
        let seen = bucket.pop_frame().unwrap();
        assert_eq!(seen.frame().origin(), FrameOrigin::Local);
        handle.shutdown();
    }
}
