//! The bus controller: one station's lifecycle on the ring, as a pure state
//! machine.
//!
//! [`BusController`] consumes events (frames, idle polls, link faults) and
//! returns the follow-up machine plus the [`Action`]s the caller must
//! perform, in order. [`BusController::poll`] names the line interaction to
//! perform next. The machine never touches a transport or a clock beyond the
//! `now` arguments, so every transition is testable with synthetic time; the
//! [`driver`](crate::driver) module runs it against real hardware.
//!
//! ```
//! use ds485_proto::{BusController, BusEvent, Config, ControllerState, DeviceId};
//! use std::time::Instant;
//!
//! let id = DeviceId::new(0x3504175fe0000000, 0xcafe);
//! let machine = BusController::new(Config::new(id));
//! assert_eq!(machine.state(), ControllerState::Initial);
//! // the first idle poll arms the sense window
//! let (machine, _actions) = machine.step(BusEvent::Idle, Instant::now());
//! assert_eq!(machine.state(), ControllerState::Sensing);
//! ```

use arrayvec::ArrayVec;
use log::{debug, error, info, warn};
use rand::Rng;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::frame::{Command, CommandFrame, Frame};
use crate::types::{station, DeviceId, Station};

/// Base listen time before a silent bus is declared, jittered per attempt.
const SENSE_WINDOW_BASE: Duration = Duration::from_millis(2500);
const SENSE_WINDOW_JITTER_MS: u64 = 1000;
/// Regular frame poll window.
const POLL_WINDOW: Duration = Duration::from_millis(200);
/// Poll window while nobody else is on the bus.
const LONELY_POLL_WINDOW: Duration = Duration::from_millis(1000);
/// Dwell before a designated master restarts the ring search.
const DESIGNATED_MASTER_DWELL: Duration = Duration::from_secs(10);
/// Join handshake progress deadline.
const JOIN_DEADLINE: Duration = Duration::from_secs(5);
/// Deadline for the first token after linking in.
const FIRST_TOKEN_DEADLINE: Duration = Duration::from_secs(20);
/// Deadline between tokens once on the ring.
const TOKEN_DEADLINE: Duration = Duration::from_secs(15);
/// Wait for a reply after transmitting a pending frame.
const ACK_WINDOW: Duration = Duration::from_millis(50);
/// Empty poll windows before the silence watchdog restarts.
const MISSED_FRAME_LIMIT: u32 = 50;
/// Tokens a fresh ring member lets pass before it starts transmitting.
const TOKEN_WARMUP: u32 = 10;
/// Communication error backoff unit and cap.
const BACKOFF_UNIT: Duration = Duration::from_millis(500);
const BACKOFF_CAP: u32 = 60;

/// The externally visible controller state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControllerState {
    Initial,
    Sensing,
    DesignatedMaster,
    SlaveWaitingToJoin,
    SlaveJoining,
    SlaveWaitingForFirstToken,
    Slave,
    /// Reserved for the bus-master role; never entered here.
    Master,
    CommError,
    Error,
}

impl ControllerState {
    pub const fn name(self) -> &'static str {
        match self {
            ControllerState::Initial => "initial",
            ControllerState::Sensing => "sensing",
            ControllerState::DesignatedMaster => "designated master",
            ControllerState::SlaveWaitingToJoin => "slave waiting to join",
            ControllerState::SlaveJoining => "slave joining",
            ControllerState::SlaveWaitingForFirstToken => "slave waiting for first token",
            ControllerState::Slave => "slave",
            ControllerState::Master => "master",
            ControllerState::CommError => "comm error",
            ControllerState::Error => "error",
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The station's device id, announced when joining the ring.
    pub device_id: DeviceId,
    /// Ignore short solicits; join only via the long variant.
    pub deny_short_join: bool,
}

impl Config {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            deny_short_join: false,
        }
    }
}

/// One input to the machine.
#[derive(Debug)]
pub enum BusEvent {
    /// A decoded frame.
    Frame(Frame),
    /// The requested poll window elapsed without a frame.
    Idle,
    /// At least one byte seen while sensing.
    Traffic,
    /// The transport came back after a reset.
    LinkUp,
    /// The transport failed (open, read or write).
    LinkError,
    /// A caller queued a frame for transmission.
    Enqueue(CommandFrame),
}

/// Follow-up work for the driving loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Transmit a frame now.
    Send(Frame),
    /// Hand a received frame to distribution.
    Deliver(CommandFrame),
}

pub type Actions = ArrayVec<Action, 4>;

/// The line interaction the driving loop should perform next.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Poll {
    /// Sleep briefly, then report [`BusEvent::Idle`].
    Sleep(Duration),
    /// Sense for traffic; report [`BusEvent::Traffic`] or [`BusEvent::Idle`].
    Sense(Duration),
    /// Read frames; report [`BusEvent::Frame`] or [`BusEvent::Idle`].
    Read(Duration),
    /// Sleep, then reset the transport; report [`BusEvent::LinkUp`] or
    /// [`BusEvent::LinkError`].
    Reconnect(Duration),
    /// The machine gave up; stop the loop.
    Halt,
}

type CommonState = Box<CommonStateStruct>;

#[derive(Debug)]
struct CommonStateStruct {
    device_id: DeviceId,
    deny_short_join: bool,
    station_id: Option<Station>,
    next_station: Option<Station>,
    token_counter: u32,
    pending: VecDeque<CommandFrame>,
    missed_frames: u32,
    last_sent_was_token: bool,
    backoff_scaler: u32,
}

impl CommonStateStruct {
    fn token(&self) -> Option<Frame> {
        Some(Frame::token(self.next_station?, self.station_id?))
    }

    fn is_self(&self, other: Station) -> bool {
        self.station_id == Some(other)
    }
}

#[derive(Debug)]
pub struct Initial {
    state: CommonState,
}

#[derive(Debug)]
pub struct Sensing {
    state: CommonState,
    deadline: Instant,
}

#[derive(Debug)]
pub struct DesignatedMaster {
    state: CommonState,
    until: Instant,
}

#[derive(Debug)]
pub struct WaitingToJoin {
    state: CommonState,
    skip: Option<u32>,
    discard_first: bool,
}

#[derive(Debug)]
pub struct Joining {
    state: CommonState,
    deadline: Instant,
}

#[derive(Debug)]
pub struct WaitingForFirstToken {
    state: CommonState,
    deadline: Instant,
}

#[derive(Debug)]
pub struct SlaveRing {
    state: CommonState,
    token_deadline: Instant,
    ack_deadline: Option<Instant>,
}

#[derive(Debug)]
pub struct CommError {
    state: CommonState,
}

#[derive(Debug)]
pub struct Faulted {
    state: CommonState,
}

/// One station on the ring.
#[derive(Debug)]
pub enum BusController {
    Initial(Initial),
    Sensing(Sensing),
    DesignatedMaster(DesignatedMaster),
    SlaveWaitingToJoin(WaitingToJoin),
    SlaveJoining(Joining),
    SlaveWaitingForFirstToken(WaitingForFirstToken),
    Slave(SlaveRing),
    CommError(CommError),
    Error(Faulted),
}

impl BusController {
    pub fn new(config: Config) -> Self {
        Initial::from_state(Box::new(CommonStateStruct {
            device_id: config.device_id,
            deny_short_join: config.deny_short_join,
            station_id: None,
            next_station: None,
            token_counter: 0,
            pending: VecDeque::new(),
            missed_frames: 0,
            last_sent_was_token: false,
            backoff_scaler: 1,
        }))
    }

    /// Consume one event. Returns the follow-up machine and the actions the
    /// caller must perform, in order.
    pub fn step(self, event: BusEvent, now: Instant) -> (Self, Actions) {
        let before = self.state();
        let mut actions = Actions::new();
        let next = self.dispatch(event, now, &mut actions);
        let after = next.state();
        if before != after {
            info!("ds485: state {} -> {}", before, after);
        }
        (next, actions)
    }

    /// The next line interaction the driving loop should perform.
    pub fn poll(&self, now: Instant) -> Poll {
        match self {
            BusController::Initial(_) => Poll::Sleep(Duration::from_millis(0)),
            BusController::Sensing(s) => Poll::Sense(remaining(s.deadline, now)),
            BusController::DesignatedMaster(s) => {
                Poll::Read(LONELY_POLL_WINDOW.min(remaining(s.until, now)))
            }
            BusController::Slave(s) => match s.ack_deadline {
                Some(deadline) => Poll::Read(POLL_WINDOW.min(remaining(deadline, now))),
                None => Poll::Read(POLL_WINDOW),
            },
            BusController::SlaveWaitingToJoin(_)
            | BusController::SlaveJoining(_)
            | BusController::SlaveWaitingForFirstToken(_) => Poll::Read(POLL_WINDOW),
            BusController::CommError(s) => Poll::Reconnect(BACKOFF_UNIT * s.state.backoff_scaler),
            BusController::Error(_) => Poll::Halt,
        }
    }

    pub fn state(&self) -> ControllerState {
        match self {
            BusController::Initial(_) => ControllerState::Initial,
            BusController::Sensing(_) => ControllerState::Sensing,
            BusController::DesignatedMaster(_) => ControllerState::DesignatedMaster,
            BusController::SlaveWaitingToJoin(_) => ControllerState::SlaveWaitingToJoin,
            BusController::SlaveJoining(_) => ControllerState::SlaveJoining,
            BusController::SlaveWaitingForFirstToken(_) => {
                ControllerState::SlaveWaitingForFirstToken
            }
            BusController::Slave(_) => ControllerState::Slave,
            BusController::CommError(_) => ControllerState::CommError,
            BusController::Error(_) => ControllerState::Error,
        }
    }

    /// Tokens seen since the ring was last joined.
    pub fn token_count(&self) -> u32 {
        self.common().token_counter
    }

    /// Frames queued for transmission.
    pub fn pending_frames(&self) -> usize {
        self.common().pending.len()
    }

    pub fn station_id(&self) -> Option<Station> {
        self.common().station_id
    }

    /// Give up for good; the poll directive becomes [`Poll::Halt`].
    pub fn fail(self) -> Self {
        Faulted::from_state(self.into_state())
    }

    fn dispatch(self, event: BusEvent, now: Instant, actions: &mut Actions) -> Self {
        match event {
            BusEvent::Enqueue(frame) => self.on_enqueue(frame),
            BusEvent::Frame(frame) => self.on_frame(frame, now, actions),
            BusEvent::Idle => self.on_idle(now, actions),
            BusEvent::Traffic => self.on_traffic(),
            BusEvent::LinkUp => self.on_link_up(),
            BusEvent::LinkError => self.on_link_error(),
        }
    }

    fn on_enqueue(mut self, frame: CommandFrame) -> Self {
        self.common_mut().pending.push_back(frame);
        self
    }

    fn on_traffic(self) -> Self {
        match self {
            BusController::Sensing(mut s) => {
                s.state.backoff_scaler = 1;
                info!("ds485: sensed traffic on the line");
                WaitingToJoin::from_state(s.state)
            }
            other => other,
        }
    }

    fn on_link_up(self) -> Self {
        match self {
            BusController::CommError(s) => Initial::from_state(s.state),
            other => other,
        }
    }

    fn on_link_error(mut self) -> Self {
        if let BusController::CommError(s) = &mut self {
            s.state.backoff_scaler = (s.state.backoff_scaler + 1).min(BACKOFF_CAP);
            return self;
        }
        if let BusController::Error(_) = self {
            return self;
        }
        error!("ds485: communication error, reconnecting");
        CommError::from_state(self.into_state())
    }

    fn on_idle(self, now: Instant, actions: &mut Actions) -> Self {
        match self {
            BusController::Initial(s) => Sensing::from_state(s.state, now),
            BusController::Sensing(mut s) => {
                s.state.backoff_scaler = 1;
                info!("ds485: no traffic on the line");
                DesignatedMaster::from_state(s.state, now)
            }
            BusController::DesignatedMaster(s) => {
                if now >= s.until {
                    Initial::from_state(s.state)
                } else {
                    BusController::DesignatedMaster(s)
                }
            }
            s @ BusController::CommError(_) | s @ BusController::Error(_) => s,
            mut other => {
                {
                    let common = other.common_mut();
                    common.missed_frames += 1;
                    if common.missed_frames >= MISSED_FRAME_LIMIT {
                        warn!("ds485: no traffic on the line, restarting");
                        return Initial::from_state(other.into_state());
                    }
                    if common.last_sent_was_token {
                        common.last_sent_was_token = false;
                        if let Some(token) = common.token() {
                            actions.push(Action::Send(token));
                        }
                    }
                }
                other.check_deadlines(now, actions)
            }
        }
    }

    fn check_deadlines(self, now: Instant, actions: &mut Actions) -> Self {
        match self {
            BusController::SlaveJoining(s) => {
                if now >= s.deadline {
                    error!("ds485: startup timeout, restarting");
                    Initial::from_state(s.state)
                } else {
                    BusController::SlaveJoining(s)
                }
            }
            BusController::SlaveWaitingForFirstToken(s) => {
                if now >= s.deadline {
                    error!("ds485: timed out waiting for the first token, restarting");
                    Initial::from_state(s.state)
                } else {
                    BusController::SlaveWaitingForFirstToken(s)
                }
            }
            BusController::Slave(mut s) => {
                if let Some(deadline) = s.ack_deadline {
                    if now >= deadline {
                        debug!("ds485: no reply received, keeping frame for retry");
                        s.ack_deadline = None;
                        s.pass_token(now, actions);
                        return BusController::Slave(s);
                    }
                }
                if now >= s.token_deadline {
                    error!("ds485: token timeout, restarting");
                    return Initial::from_state(s.state);
                }
                BusController::Slave(s)
            }
            other => other,
        }
    }

    fn on_frame(mut self, frame: Frame, now: Instant, actions: &mut Actions) -> Self {
        // the first frame after sensing traffic is still suspect
        if let BusController::SlaveWaitingToJoin(s) = &mut self {
            if s.discard_first {
                s.discard_first = false;
                return self;
            }
        }

        {
            let common = self.common_mut();
            common.missed_frames = 0;
            common.last_sent_was_token = false;

            // own transmissions echo back on the half-duplex line
            if common.is_self(frame.header().source) {
                return self;
            }
        }

        if let Frame::Command(request) = &frame {
            // answered from any state that has an id, even mid-join
            if request.command == Command::GetAddressRequest
                && self.common().is_self(request.header.destination)
            {
                debug!("ds485: received get address request");
                if let Some(me) = self.common().station_id {
                    let response =
                        CommandFrame::new(request.header.source, me, Command::GetAddressResponse);
                    actions.push(Action::Send(response.into()));
                }
                return self;
            }

            if request.command == Command::SolicitSuccessorRequest
                && matches!(self, BusController::Slave(_))
            {
                error!("ds485: bus is reorganizing, restarting");
                return Initial::from_state(self.into_state());
            }
        }

        if let BusController::Slave(_) = &self {
            let header = frame.header();
            if !header.broadcast && !self.common().is_self(header.destination) {
                return self;
            }
        }

        match self {
            BusController::SlaveWaitingToJoin(s) => s.on_frame(frame, now, actions),
            BusController::SlaveJoining(s) => s.on_frame(frame, now, actions),
            BusController::SlaveWaitingForFirstToken(s) => s.on_frame(frame, now, actions),
            BusController::Slave(s) => s.on_frame(frame, now, actions),
            BusController::DesignatedMaster(s) => {
                if now >= s.until {
                    Initial::from_state(s.state)
                } else {
                    BusController::DesignatedMaster(s)
                }
            }
            other => other,
        }
    }

    fn common(&self) -> &CommonStateStruct {
        use BusController::*;
        match self {
            Initial(s) => &s.state,
            Sensing(s) => &s.state,
            DesignatedMaster(s) => &s.state,
            SlaveWaitingToJoin(s) => &s.state,
            SlaveJoining(s) => &s.state,
            SlaveWaitingForFirstToken(s) => &s.state,
            Slave(s) => &s.state,
            CommError(s) => &s.state,
            Error(s) => &s.state,
        }
    }

    fn common_mut(&mut self) -> &mut CommonStateStruct {
        use BusController::*;
        match self {
            Initial(s) => &mut s.state,
            Sensing(s) => &mut s.state,
            DesignatedMaster(s) => &mut s.state,
            SlaveWaitingToJoin(s) => &mut s.state,
            SlaveJoining(s) => &mut s.state,
            SlaveWaitingForFirstToken(s) => &mut s.state,
            Slave(s) => &mut s.state,
            CommError(s) => &mut s.state,
            Error(s) => &mut s.state,
        }
    }

    fn into_state(self) -> CommonState {
        use BusController::*;
        match self {
            Initial(s) => s.state,
            Sensing(s) => s.state,
            DesignatedMaster(s) => s.state,
            SlaveWaitingToJoin(s) => s.state,
            SlaveJoining(s) => s.state,
            SlaveWaitingForFirstToken(s) => s.state,
            Slave(s) => s.state,
            CommError(s) => s.state,
            Error(s) => s.state,
        }
    }
}

fn remaining(deadline: Instant, now: Instant) -> Duration {
    deadline
        .checked_duration_since(now)
        .unwrap_or(Duration::from_millis(0))
}

fn assigned_station(frame: &CommandFrame) -> Option<Station> {
    let byte = frame.payload().dissector().read_u8().ok()?;
    Station::new(byte).ok()
}

fn accept_successor(state: &mut CommonStateStruct, next: Station, actions: &mut Actions) {
    state.next_station = Some(next);
    if let Some(me) = state.station_id {
        let response = CommandFrame::new(station(0), me, Command::SetSuccessorAddressResponse);
        actions.push(Action::Send(response.into()));
    }
}

// Sent unicast to station 0, not broadcast; the bus master listens there.
fn solicit_response(device_id: DeviceId) -> CommandFrame {
    let mut frame =
        CommandFrame::new(station(0), Station::PROVISIONAL, Command::SolicitSuccessorResponse);
    frame
        .payload_mut()
        .add_device_id(device_id)
        .expect("BUG: device id payload too large.");
    frame
}

impl Initial {
    fn from_state(mut state: CommonState) -> BusController {
        state.station_id = None;
        state.next_station = None;
        state.token_counter = 0;
        state.missed_frames = 0;
        state.last_sent_was_token = false;
        BusController::Initial(Initial { state })
    }
}

impl Sensing {
    fn from_state(state: CommonState, now: Instant) -> BusController {
        let jitter = rand::thread_rng().gen_range(0..SENSE_WINDOW_JITTER_MS);
        BusController::Sensing(Sensing {
            state,
            deadline: now + SENSE_WINDOW_BASE + Duration::from_millis(jitter),
        })
    }
}

impl DesignatedMaster {
    fn from_state(state: CommonState, now: Instant) -> BusController {
        BusController::DesignatedMaster(DesignatedMaster {
            state,
            until: now + DESIGNATED_MASTER_DWELL,
        })
    }
}

impl WaitingToJoin {
    fn from_state(state: CommonState) -> BusController {
        BusController::SlaveWaitingToJoin(WaitingToJoin {
            state,
            skip: None,
            discard_first: true,
        })
    }

    fn on_frame(mut self, frame: Frame, now: Instant, actions: &mut Actions) -> BusController {
        let frame = match frame {
            Frame::Command(frame) => frame,
            Frame::Token(_) => return BusController::SlaveWaitingToJoin(self),
        };
        match frame.command {
            Command::SolicitSuccessorRequestLong => {}
            Command::SolicitSuccessorRequest if !self.state.deny_short_join => {}
            _ => return BusController::SlaveWaitingToJoin(self),
        }
        match self.skip {
            // the first solicit seen decides how long we hold back
            None => {
                let mut rng = rand::thread_rng();
                let initial = if frame.command == Command::SolicitSuccessorRequest {
                    rng.gen_range(10..20)
                } else {
                    rng.gen_range(0..10)
                };
                self.skip = Some(initial);
            }
            Some(0) => {
                self.state.station_id = Some(Station::PROVISIONAL);
                actions.push(Action::Send(
                    solicit_response(self.state.device_id).into(),
                ));
                return Joining::from_state(self.state, now);
            }
            Some(count) => {
                self.skip = Some(count - 1);
            }
        }
        BusController::SlaveWaitingToJoin(self)
    }
}

impl Joining {
    fn from_state(state: CommonState, now: Instant) -> BusController {
        BusController::SlaveJoining(Joining {
            state,
            deadline: now + JOIN_DEADLINE,
        })
    }

    fn on_frame(mut self, frame: Frame, now: Instant, actions: &mut Actions) -> BusController {
        let frame = match frame {
            Frame::Command(frame) => frame,
            Frame::Token(_) => return BusController::SlaveJoining(self),
        };
        match frame.command {
            Command::SetDeviceAddressRequest if self.state.is_self(frame.header.destination) => {
                match assigned_station(&frame) {
                    Some(assigned) => {
                        self.state.station_id = Some(assigned);
                        info!("ds485: got address {}", assigned);
                        let response =
                            CommandFrame::new(station(0), assigned, Command::SetDeviceAddressResponse);
                        actions.push(Action::Send(response.into()));
                        self.deadline = now + JOIN_DEADLINE;
                    }
                    None => warn!("ds485: set device address request without a valid address"),
                }
            }
            Command::SetSuccessorAddressRequest
                if self.state.is_self(frame.header.destination) =>
            {
                match assigned_station(&frame) {
                    Some(next) => {
                        accept_successor(&mut self.state, next, actions);
                        self.deadline = now + JOIN_DEADLINE;
                    }
                    None => warn!("ds485: set successor address request without a valid address"),
                }
            }
            _ => {
                if now >= self.deadline {
                    error!("ds485: startup timeout, restarting");
                    return Initial::from_state(self.state);
                }
            }
        }
        if self.linked() {
            info!("ds485: linked into the network");
            return WaitingForFirstToken::from_state(self.state, now);
        }
        BusController::SlaveJoining(self)
    }

    fn linked(&self) -> bool {
        self.state.station_id.is_some()
            && self.state.station_id != Some(Station::PROVISIONAL)
            && self.state.next_station.is_some()
    }
}

impl WaitingForFirstToken {
    fn from_state(state: CommonState, now: Instant) -> BusController {
        BusController::SlaveWaitingForFirstToken(WaitingForFirstToken {
            state,
            deadline: now + FIRST_TOKEN_DEADLINE,
        })
    }

    fn on_frame(mut self, frame: Frame, now: Instant, actions: &mut Actions) -> BusController {
        match frame {
            Frame::Token(header) if self.state.is_self(header.destination) => {
                info!("ds485: got first token");
                if let Some(token) = self.state.token() {
                    actions.push(Action::Send(token));
                }
                self.state.token_counter = 0;
                self.state.last_sent_was_token = true;
                return BusController::Slave(SlaveRing {
                    state: self.state,
                    token_deadline: now + TOKEN_DEADLINE,
                    ack_deadline: None,
                });
            }
            Frame::Token(_) => {}
            Frame::Command(_) => {
                // other stations are still being linked in
                self.deadline = now + FIRST_TOKEN_DEADLINE;
            }
        }
        if now >= self.deadline {
            error!("ds485: timed out waiting for the first token, restarting");
            return Initial::from_state(self.state);
        }
        BusController::SlaveWaitingForFirstToken(self)
    }
}

impl SlaveRing {
    fn on_frame(mut self, frame: Frame, now: Instant, actions: &mut Actions) -> BusController {
        if self.ack_deadline.is_some() {
            return self.on_reply(frame, now, actions);
        }
        match frame {
            Frame::Token(_) => {
                if self.state.token_counter > TOKEN_WARMUP {
                    if let Some(front) = self.state.pending.front() {
                        let broadcast = front.header.broadcast;
                        let mut outgoing = front.clone();
                        if let Some(me) = self.state.station_id {
                            outgoing.header.source = me;
                        }
                        actions.push(Action::Send(outgoing.into()));
                        if broadcast {
                            self.state.pending.pop_front();
                        } else {
                            self.ack_deadline = Some(now + ACK_WINDOW);
                            return BusController::Slave(self);
                        }
                    }
                }
                self.pass_token(now, actions);
                BusController::Slave(self)
            }
            Frame::Command(frame) => self.on_command(frame, now, actions),
        }
    }

    /// The window after transmitting a pending frame: the next frame on the
    /// line decides the frame's fate, then the token moves on.
    fn on_reply(mut self, frame: Frame, now: Instant, actions: &mut Actions) -> BusController {
        self.ack_deadline = None;
        match frame {
            Frame::Command(reply) => match reply.command {
                Command::Ack => {
                    self.state.pending.pop_front();
                }
                Command::Response => {
                    self.state.pending.pop_front();
                    actions.push(Action::Deliver(reply));
                }
                Command::Busy => {
                    debug!("ds485: station busy, keeping frame for retry");
                }
                other => {
                    warn!("ds485: invalid reply to a request: {}", other);
                }
            },
            Frame::Token(_) => {
                // not a reply; leave the frame queued
            }
        }
        self.pass_token(now, actions);
        BusController::Slave(self)
    }

    fn on_command(mut self, frame: CommandFrame, now: Instant, actions: &mut Actions) -> BusController {
        if now >= self.token_deadline {
            error!("ds485: token timeout, restarting");
            return Initial::from_state(self.state);
        }
        let mut keep = false;
        match frame.command {
            Command::Request | Command::Response | Command::Event => {
                if !frame.header.broadcast {
                    self.ack(&frame, actions);
                }
                keep = true;
            }
            Command::SetSuccessorAddressRequest
                if self.state.is_self(frame.header.destination) =>
            {
                match assigned_station(&frame) {
                    Some(next) => accept_successor(&mut self.state, next, actions),
                    None => warn!("ds485: set successor address request without a valid address"),
                }
            }
            other => debug!("ds485: ignoring {} frame", other),
        }
        if keep {
            actions.push(Action::Deliver(frame));
        }
        BusController::Slave(self)
    }

    fn ack(&self, frame: &CommandFrame, actions: &mut Actions) {
        if let Some(me) = self.state.station_id {
            let ack = CommandFrame::new(frame.header.source, me, Command::Ack);
            actions.push(Action::Send(ack.into()));
        }
    }

    fn pass_token(&mut self, now: Instant, actions: &mut Actions) {
        if let Some(token) = self.state.token() {
            actions.push(Action::Send(token));
        }
        self.token_deadline = now + TOKEN_DEADLINE;
        self.state.token_counter += 1;
        self.state.last_sent_was_token = true;
    }
}

impl CommError {
    fn from_state(state: CommonState) -> BusController {
        BusController::CommError(CommError { state })
    }
}

impl Faulted {
    fn from_state(state: CommonState) -> BusController {
        error!("ds485: bus controller halted");
        BusController::Error(Faulted { state })
    }
}
