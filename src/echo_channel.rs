//! The IN side of a relay instance: receive framed records, answer each with an ACK.
//!
//! The handler does not interpret record contents. By contract the first four payload
//!  bytes carry the peer's cookie, and they are echoed behind the ACK marker exactly as
//!  they arrived.

use tracing::{error, warn};

use crate::channel_io::RelayChannel;
use crate::frame::{self, RecordRead};
use crate::stats::InWindow;
use crate::RelayError;

/// Outcome of one [`InboundHandler::echo`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum EchoStep {
    /// a record arrived and its ACK went out (or at least was attempted)
    Echoed,
    /// a record arrived but could not be acknowledged (oversized or runt); the channel
    ///  stays up
    Skipped,
    /// the peer shut the IN connection down, or it failed
    PeerClosed,
}

pub struct InboundHandler {
    /// resident buffer for one record: the cookie word plus the payload
    record_buf: Vec<u8>,
    window_received: u32,
    window_acks_sent: u32,
}

impl InboundHandler {
    pub fn new(payload_len: usize) -> InboundHandler {
        InboundHandler {
            record_buf: vec![0; frame::COOKIE_LEN + payload_len],
            window_received: 0,
            window_acks_sent: 0,
        }
    }

    /// Reads one framed record and acknowledges it. An ACK send failure is logged but
    ///  does not bring the channel down.
    pub async fn echo(&mut self, ch: &dyn RelayChannel) -> EchoStep {
        let read = match frame::read_framed_record(ch, &mut self.record_buf).await {
            Ok(RecordRead::PeerClosed) => {
                warn!("IN client disconnected");
                return EchoStep::PeerClosed;
            }
            Ok(RecordRead::Complete(n)) => n,
            Err(RelayError::MessageTooBig { len, capacity }) => {
                warn!(
                    "skipping framed record of {} bytes (buffer holds {})",
                    len, capacity
                );
                return EchoStep::Skipped;
            }
            Err(e) => {
                error!("recv failed on the IN channel: {}", e);
                return EchoStep::PeerClosed;
            }
        };
        if read < frame::COOKIE_LEN {
            warn!("framed record of {} bytes carries no cookie - skipping", read);
            return EchoStep::Skipped;
        }
        self.window_received += 1;

        let cookie_bytes = [
            self.record_buf[0],
            self.record_buf[1],
            self.record_buf[2],
            self.record_buf[3],
        ];
        let ack = frame::encode_ack(cookie_bytes);
        if let Err(e) = ch.send(&ack).await {
            error!("failed to send ACK on the IN channel: {}", e);
            return EchoStep::Echoed;
        }
        self.window_acks_sent += 1;
        EchoStep::Echoed
    }

    /// Snapshots the window counters and resets them for the next window.
    pub fn take_window(&mut self) -> InWindow {
        let window = InWindow {
            received: self.window_received,
            acks_sent: self.window_acks_sent,
        };
        self.window_received = 0;
        self.window_acks_sent = 0;
        window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_io::test_support::{ReadStep, ScriptedChannel};
    use bytes::BufMut;

    fn framed(cookie: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        frame::encode_packet(cookie, payload, &mut buf);
        buf
    }

    #[tokio::test]
    async fn test_echoes_the_cookie_bytes() {
        let mut handler = InboundHandler::new(16);
        let ch = ScriptedChannel::new(vec![ReadStep::Chunk(framed(0xDEAD_BEEF, &[0; 16]))]);

        assert_eq!(handler.echo(&ch).await, EchoStep::Echoed);

        assert_eq!(
            ch.sent_buffers(),
            vec![vec![0x06, 0xDE, 0xAD, 0xBE, 0xEF]]
        );
        let window = handler.take_window();
        assert_eq!(window.received, 1);
        assert_eq!(window.acks_sent, 1);
    }

    #[tokio::test]
    async fn test_peer_close_ends_the_channel() {
        let mut handler = InboundHandler::new(16);
        let ch = ScriptedChannel::new(vec![]);

        assert_eq!(handler.echo(&ch).await, EchoStep::PeerClosed);
        assert_eq!(handler.take_window().received, 0);
    }

    #[tokio::test]
    async fn test_oversized_record_is_skipped_and_the_channel_continues() {
        let mut handler = InboundHandler::new(8);
        let big = framed(1, &[7; 80]);
        let ch = ScriptedChannel::new(vec![
            ReadStep::Chunk(big),
            ReadStep::Chunk(framed(0x01020304, &[0; 8])),
        ]);

        assert_eq!(handler.echo(&ch).await, EchoStep::Skipped);
        assert_eq!(handler.echo(&ch).await, EchoStep::Echoed);

        assert_eq!(ch.sent_buffers(), vec![vec![0x06, 1, 2, 3, 4]]);
        let window = handler.take_window();
        assert_eq!(window.received, 1);
        assert_eq!(window.acks_sent, 1);
    }

    #[tokio::test]
    async fn test_runt_record_is_skipped() {
        let mut handler = InboundHandler::new(16);
        // a record whose length field says two bytes - too short for a cookie
        let mut runt = Vec::new();
        runt.put_u32(2);
        runt.put_slice(&[9, 9]);
        let ch = ScriptedChannel::new(vec![ReadStep::Chunk(runt)]);

        assert_eq!(handler.echo(&ch).await, EchoStep::Skipped);
        assert_eq!(handler.take_window().received, 0);
        assert!(ch.sent_buffers().is_empty());
    }

    #[tokio::test]
    async fn test_ack_send_failure_does_not_end_the_channel() {
        let mut handler = InboundHandler::new(16);
        let ch = ScriptedChannel::failing_sends(vec![ReadStep::Chunk(framed(5, &[0; 16]))]);

        assert_eq!(handler.echo(&ch).await, EchoStep::Echoed);

        let window = handler.take_window();
        assert_eq!(window.received, 1);
        assert_eq!(window.acks_sent, 0);
    }
}
