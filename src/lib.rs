//! Token-ring bus access for DS485 networks over RS-485.
//!
//! The crate splits into three layers. [`frame`], [`payload`] and [`wire`]
//! model frames and their byte format, [`reader`] decodes the receive side.
//! [`controller`] is the pure ring state machine: joining the ring via the
//! solicit handshake, forwarding the token, transmitting queued frames.
//! [`driver`] runs that machine on its own thread against a [`Transport`]
//! and [`dispatch`] routes received application frames to waiting callers.
//!
//! The serial line itself stays behind the [`Transport`] trait, so the whole
//! stack runs unchanged against real hardware or an in-memory test bus.

pub mod controller;
mod crc;
pub mod dispatch;
pub mod driver;
pub mod frame;
mod nom_parser;
pub mod payload;
pub mod reader;
pub mod transport;
pub mod types;
pub mod wire;

pub use controller::{Action, Actions, BusController, BusEvent, Config, ControllerState, Poll};
pub use crc::{crc16, update_crc};
pub use dispatch::{FrameBucket, FrameDispatcher, ReceivedFrame};
pub use driver::{BusDriver, BusHandle};
pub use frame::{
    Command, CommandFrame, Frame, FrameKind, FrameOrigin, Header, ESCAPE, FRAME_START,
};
pub use payload::{Payload, PayloadDissector, MAX_PAYLOAD};
pub use reader::{FrameReader, ReaderStats};
pub use transport::Transport;
pub use types::{station, DeviceId, IntoStation, Station};
