use anyhow::bail;
use std::net::IpAddr;
use std::time::Duration;

use crate::frame;

/// Per-instance configuration. One instance serves one network interface; a multi-homed
///  host runs several instances with identical tunables but different bind specs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// local address both listeners bind to
    pub host: IpAddr,
    pub out_port: u16,
    pub in_port: u16,

    /// network device to bind to (`SO_BINDTODEVICE`). `None` leaves routing to the kernel,
    ///  which is only meaningful for single-homed test setups.
    pub device: Option<String>,

    /// interval between generated outbound messages
    pub send_cadence: Duration,

    /// how long an unacknowledged message stays in the in-flight pool before its slot is
    ///  released. This bounds pool occupancy together with `pool_size`.
    pub ack_timeout: Duration,

    /// length of the statistics window
    pub stats_interval: Duration,

    /// number of in-flight pool slots, i.e. the maximum number of unacknowledged messages
    pub pool_size: usize,

    /// payload bytes per generated message (the last byte is a NUL terminator)
    pub payload_len: usize,

    pub listen_backlog: u32,
}

impl RelayConfig {
    pub fn new(host: IpAddr, out_port: u16, in_port: u16, device: Option<String>) -> RelayConfig {
        RelayConfig {
            host,
            out_port,
            in_port,
            device,
            send_cadence: Duration::from_millis(20),
            ack_timeout: Duration::from_millis(1000),
            stats_interval: Duration::from_millis(5000),
            pool_size: 128,
            payload_len: 3700,
            listen_backlog: 5,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.send_cadence.is_zero() {
            bail!("send cadence must be non-zero");
        }
        if self.ack_timeout.is_zero() {
            bail!("ACK timeout must be non-zero");
        }
        if self.pool_size == 0 {
            bail!("in-flight pool must have at least one slot");
        }
        if self.payload_len <= frame::COOKIE_LEN {
            bail!("payload size is too small to carry a cookie for the echo side");
        }
        if self.stats_interval < self.send_cadence {
            bail!("statistics window is shorter than the send cadence");
        }
        Ok(())
    }

    /// Number of sent messages after which statistics are emitted. The window length is
    ///  authoritative; the threshold is derived from it and the cadence.
    pub fn stats_threshold(&self) -> u32 {
        (self.stats_interval.as_millis() / self.send_cadence.as_millis()).max(1) as u32
    }
}
