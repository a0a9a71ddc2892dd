//! A dual-channel reliable messaging relay for comparing two physical networks side by side.
//!
//! Each relay instance binds to one network interface and serves two independent TCP
//!  endpoints:
//!
//! * the **OUT** channel, on which the relay generates and transmits framed messages at a
//!    fixed cadence and expects a per-message acknowledgement from its peer
//! * the **IN** channel, on which the relay receives framed messages from its peer and
//!    answers each with an acknowledgement
//!
//! Running one instance per interface on a multi-homed host lets an external observer
//!  compare loss and latency across the networks simultaneously. Messages carry no
//!  application payload - they are filler whose only purpose is the periodic statistics
//!  summary (throughput, lost acknowledgements, round-trip times). A message whose
//!  acknowledgement does not arrive in time is *dropped*, never re-sent: the relay measures
//!  the networks, it does not paper over them.
//!
//! ## Wire format
//!
//! Messages on both channels are framed records - all numbers in network byte order (BE):
//!
//! ```ascii
//! 0: record length (u32): length of everything after this field, i.e. 4 + payload length
//! 4: cookie (u32): monotonic per-session message identifier
//! 8: payload
//! ```
//!
//! Acknowledgements are fixed five-byte records:
//!
//! ```ascii
//! 0: ACK marker (0x06)
//! 1: the four cookie bytes of the acknowledged record, echoed verbatim
//! ```
//!
//! The IN side does not interpret record contents: it echoes the first four payload bytes
//!  behind the marker, which by contract carry the peer's cookie.
//!
//! ## Structure
//!
//! Within one instance everything runs cooperatively on a single task: the
//!  [`timer_wheel::TimerWheel`] combines the pending-timer queue with the suspension on
//!  socket readiness, so send cadence, drop deadlines and network events all surface
//!  through one `wait` point and no state needs locking. Instances share only the
//!  [`console::SafeConsole`] handle and the log file.

pub mod channel_io;
pub mod config;
pub mod console;
pub mod echo_channel;
pub mod frame;
pub mod send_channel;
pub mod server;
pub mod stats;
pub mod timer_wheel;

use crate::timer_wheel::TimerId;

/// Commands dispatched by the server loop when their timer comes due.
///
/// Timers carry data, not behaviour: the server is the single dispatcher that mutates
///  state, so no callback ever captures the mutable world it runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCommand {
    /// generate and send the next outbound message
    SendNext,
    /// release an in-flight slot whose acknowledgement did not arrive in time
    DropSlot(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no free slot in the in-flight pool ({0} messages unacknowledged)")]
    PoolExhausted(usize),

    #[error("framed record of {len} bytes exceeds the {capacity} byte buffer")]
    MessageTooBig { len: usize, capacity: usize },

    #[error("acknowledgement does not start with the ACK marker (got {0:#04x})")]
    MalformedAck(u8),

    /// cancelling a timer that is not registered is a caller bug, not a runtime condition
    #[error("cancelling unknown timer {0:?}")]
    NoSuchTimer(TimerId),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
