//! Encoding and decoding of the two record types on the wire: length-prefixed framed
//!  records and fixed five-byte acknowledgements.

use bytes::BufMut;
use std::io;

use crate::channel_io::RelayChannel;
use crate::RelayError;

pub const ACK_MARKER: u8 = 0x06;
pub const ACK_LEN: usize = 5;
pub const COOKIE_LEN: usize = 4;

/// Outcome of reading one framed record.
#[derive(Debug, PartialEq, Eq)]
pub enum RecordRead {
    /// a whole record arrived; the value is its length after the length prefix
    Complete(usize),
    /// the peer shut the connection down cleanly (possibly mid-record)
    PeerClosed,
}

/// Appends `len` ‖ `cookie` ‖ `payload` to `buf`, with `len` covering the cookie and the
///  payload but not itself.
pub fn encode_packet(cookie: u32, payload: &[u8], buf: &mut impl BufMut) {
    buf.put_u32((COOKIE_LEN + payload.len()) as u32);
    buf.put_u32(cookie);
    buf.put_slice(payload);
}

/// The five ACK bytes for a record whose cookie bytes arrived as `cookie_bytes`. The bytes
///  are echoed exactly as received - the cookie is opaque to the acknowledging side.
pub fn encode_ack(cookie_bytes: [u8; COOKIE_LEN]) -> [u8; ACK_LEN] {
    let mut ack = [0u8; ACK_LEN];
    ack[0] = ACK_MARKER;
    ack[1..].copy_from_slice(&cookie_bytes);
    ack
}

/// Extracts the acknowledged cookie, validating the marker byte.
pub fn decode_ack(ack: &[u8; ACK_LEN]) -> Result<u32, RelayError> {
    if ack[0] != ACK_MARKER {
        return Err(RelayError::MalformedAck(ack[0]));
    }
    Ok(u32::from_be_bytes([ack[1], ack[2], ack[3], ack[4]]))
}

/// Reads one framed record into `buf`.
///
/// A record longer than `buf` is drained from the stream so that framing stays intact,
///  `buf` keeps the head of the record, and the call fails with
///  [`RelayError::MessageTooBig`]. A clean shutdown before or inside a record reports
///  [`RecordRead::PeerClosed`].
pub async fn read_framed_record(
    ch: &dyn RelayChannel,
    buf: &mut [u8],
) -> Result<RecordRead, RelayError> {
    let mut len_field = [0u8; 4];
    if read_exact_or_eof(ch, &mut len_field).await? < len_field.len() {
        return Ok(RecordRead::PeerClosed);
    }
    let len = u32::from_be_bytes(len_field) as usize;

    if len > buf.len() {
        let mut scratch = vec![0u8; len];
        if read_exact_or_eof(ch, &mut scratch).await? < len {
            return Ok(RecordRead::PeerClosed);
        }
        buf.copy_from_slice(&scratch[..buf.len()]);
        return Err(RelayError::MessageTooBig {
            len,
            capacity: buf.len(),
        });
    }

    if read_exact_or_eof(ch, &mut buf[..len]).await? < len {
        return Ok(RecordRead::PeerClosed);
    }
    Ok(RecordRead::Complete(len))
}

/// Fills `buf` completely, looping over short reads. Returns the number of bytes actually
///  read, which is short of `buf.len()` exactly when the peer shut down cleanly.
///  Spurious readiness and interrupted reads are retried transparently.
async fn read_exact_or_eof(ch: &dyn RelayChannel, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        ch.readable().await?;
        match ch.try_read(&mut buf[filled..]) {
            Ok(0) => return Ok(filled),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
