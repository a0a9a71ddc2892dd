//! The OUT side of a relay instance: a bounded pool of in-flight messages.
//!
//! Every sent message occupies one pool slot until its acknowledgement arrives or its
//!  drop deadline passes. The pool caps the damage a stalled peer can do - once all
//!  slots are live, sending pauses until acknowledgements or drop timers free slots
//!  again.

use std::io;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::channel_io::RelayChannel;
use crate::frame::{self, ACK_LEN};
use crate::stats::OutWindow;
use crate::timer_wheel::{TimerId, TimerWheel};
use crate::{RelayCommand, RelayError};

enum Slot {
    Free,
    Live {
        cookie: u32,
        /// the encoded record as it went out on the wire
        packet: Vec<u8>,
        drop_timer: TimerId,
        sent_at: Instant,
    },
}

impl Slot {
    fn live_cookie(&self) -> Option<u32> {
        match self {
            Slot::Free => None,
            Slot::Live { cookie, .. } => Some(*cookie),
        }
    }
}

/// Progress made by one [`OutboundTracker::recv_ack`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum AckStep {
    /// a complete ACK arrived and freed the slot carrying this cookie
    Acked(u32),
    /// a complete ACK arrived for a cookie with no live slot (already dropped)
    Unmatched(u32),
    /// a complete ACK arrived but its marker byte was wrong; it was discarded
    Rejected,
    /// fewer than five bytes accumulated so far
    NeedMore,
    /// the peer shut the OUT connection down
    PeerClosed,
}

pub struct OutboundTracker {
    slots: Vec<Slot>,
    next_cookie: u32,
    ack_timeout: std::time::Duration,

    /// accumulator for partially received ACKs, persistent across `recv_ack` calls
    ack_buf: [u8; ACK_LEN],
    ack_filled: usize,

    window_sent: u32,
    window_acked: u32,
    rtt_total_micros: u64,
    rtt_max_micros: u64,
}

impl OutboundTracker {
    pub fn new(pool_size: usize, ack_timeout: std::time::Duration) -> OutboundTracker {
        let mut slots = Vec::with_capacity(pool_size);
        slots.resize_with(pool_size, || Slot::Free);
        OutboundTracker {
            slots,
            next_cookie: 0,
            ack_timeout,
            ack_buf: [0; ACK_LEN],
            ack_filled: 0,
            window_sent: 0,
            window_acked: 0,
            rtt_total_micros: 0,
            rtt_max_micros: 0,
        }
    }

    /// Encodes and transmits one message, claiming a pool slot and arming its drop timer.
    pub async fn send_msg(
        &mut self,
        ch: &dyn RelayChannel,
        timers: &mut TimerWheel<RelayCommand>,
        payload: &[u8],
    ) -> Result<(), RelayError> {
        let Some(idx) = self.slots.iter().position(|s| matches!(s, Slot::Free)) else {
            error!("in-flight pool exhausted, dropping outbound message");
            return Err(RelayError::PoolExhausted(self.slots.len()));
        };

        let cookie = self.alloc_cookie();
        let mut packet = Vec::with_capacity(4 + frame::COOKIE_LEN + payload.len());
        frame::encode_packet(cookie, payload, &mut packet);

        if let Err(e) = ch.send(&packet).await {
            error!("send failed on the OUT channel: {}", e);
            return Err(e.into());
        }

        let drop_timer = timers.register(RelayCommand::DropSlot(idx), self.ack_timeout);
        self.slots[idx] = Slot::Live {
            cookie,
            packet,
            drop_timer,
            sent_at: Instant::now(),
        };
        self.window_sent += 1;
        Ok(())
    }

    /// The cookie counter wraps; skipping values still carried by a live slot keeps
    ///  cookies unique among in-flight messages.
    fn alloc_cookie(&mut self) -> u32 {
        loop {
            let cookie = self.next_cookie;
            self.next_cookie = self.next_cookie.wrapping_add(1);
            if !self.slots.iter().any(|s| s.live_cookie() == Some(cookie)) {
                return cookie;
            }
        }
    }

    /// Drains (part of) one acknowledgement from the OUT socket. The caller invokes this
    ///  whenever the socket turns readable; a short read parks the bytes in the
    ///  accumulator and reports [`AckStep::NeedMore`].
    pub fn recv_ack(
        &mut self,
        ch: &dyn RelayChannel,
        timers: &mut TimerWheel<RelayCommand>,
    ) -> Result<AckStep, RelayError> {
        match ch.try_read(&mut self.ack_buf[self.ack_filled..]) {
            Ok(0) => {
                warn!("OUT client disconnected");
                return Ok(AckStep::PeerClosed);
            }
            Ok(n) => self.ack_filled += n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return Ok(AckStep::NeedMore)
            }
            Err(e) => {
                error!("recv failed on the OUT channel: {}", e);
                return Err(e.into());
            }
        }
        if self.ack_filled < ACK_LEN {
            return Ok(AckStep::NeedMore);
        }
        self.ack_filled = 0;

        let cookie = match frame::decode_ack(&self.ack_buf) {
            Ok(cookie) => cookie,
            Err(e) => {
                warn!("discarding malformed acknowledgement: {}", e);
                return Ok(AckStep::Rejected);
            }
        };
        self.window_acked += 1;

        let Some(idx) = self
            .slots
            .iter()
            .position(|s| s.live_cookie() == Some(cookie))
        else {
            debug!("no message in flight matches ACK cookie {}", cookie);
            return Ok(AckStep::Unmatched(cookie));
        };

        match std::mem::replace(&mut self.slots[idx], Slot::Free) {
            Slot::Live {
                drop_timer,
                sent_at,
                ..
            } => {
                let micros = sent_at.elapsed().as_micros() as u64;
                self.rtt_total_micros += micros;
                self.rtt_max_micros = self.rtt_max_micros.max(micros);
                timers.cancel(drop_timer)?;
            }
            Slot::Free => unreachable!("slot lookup returned a free slot"),
        }
        Ok(AckStep::Acked(cookie))
    }

    /// Drop-timer dispatch: the message's acknowledgement never arrived, release the slot.
    ///  The message is not re-sent.
    pub fn drop_slot(&mut self, idx: usize) {
        match std::mem::replace(&mut self.slots[idx], Slot::Free) {
            Slot::Live { cookie, packet, .. } => {
                debug!(
                    "dropping message {} ({} wire bytes): its ACK is lost",
                    cookie,
                    packet.len()
                );
            }
            Slot::Free => {
                error!("drop timer fired for slot {} which is already free", idx);
            }
        }
    }

    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Live { .. }))
            .count()
    }

    /// Messages sent in the current statistics window.
    pub fn window_sent(&self) -> u32 {
        self.window_sent
    }

    /// Snapshots the window counters and resets them for the next window.
    pub fn take_window(&mut self) -> OutWindow {
        let window = OutWindow {
            sent: self.window_sent,
            acks_received: self.window_acked,
            rtt_total_micros: self.rtt_total_micros,
            rtt_max_micros: self.rtt_max_micros,
        };
        self.window_sent = 0;
        self.window_acked = 0;
        self.rtt_total_micros = 0;
        self.rtt_max_micros = 0;
        window
    }
}
