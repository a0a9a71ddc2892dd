//! The dual-channel server: one instance per network interface.
//!
//! An instance alternates between two phases. In the *accept phase* it waits for one
//!  client on each of its two listeners; in the *session phase* it runs the message loop,
//!  generating outbound traffic on the OUT channel and echoing inbound traffic on the IN
//!  channel until one of the peers goes away, then returns to accepting.
//!
//! Everything in an instance runs on one task. The timer wheel is the only suspension
//!  point; drop deadlines keep being served in the accept phase, so messages still in
//!  flight when a session ends are released on schedule.

use rand::Rng;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::console::SafeConsole;
use crate::echo_channel::{EchoStep, InboundHandler};
use crate::send_channel::{AckStep, OutboundTracker};
use crate::stats::render_table;
use crate::timer_wheel::{TimerWheel, Waited};
use crate::{RelayCommand, RelayError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelSide {
    Out,
    In,
}

impl ChannelSide {
    fn label(self) -> &'static str {
        match self {
            ChannelSide::Out => "OUT",
            ChannelSide::In => "IN",
        }
    }
}

pub struct RelayServer {
    config: Arc<RelayConfig>,
    console: SafeConsole,
    timers: TimerWheel<RelayCommand>,
    xout: OutboundTracker,
    xin: InboundHandler,
    out_listener: TcpListener,
    in_listener: TcpListener,
    stats_threshold: u32,
}

impl RelayServer {
    /// Binds both listeners. Setup failures here are fatal for the instance.
    pub async fn bind(config: Arc<RelayConfig>, console: SafeConsole) -> anyhow::Result<RelayServer> {
        config.validate()?;

        let out_listener = Self::build_listener(&config, config.out_port)?;
        let in_listener = Self::build_listener(&config, config.in_port)?;

        let device = config.device.as_deref().unwrap_or("-");
        info!(
            "server listening on OUT {} and IN {}, device {}",
            out_listener.local_addr()?,
            in_listener.local_addr()?,
            device,
        );
        console.print(&format!(
            "server listening on OUT ({}) and IN ({}), device: {}\n",
            out_listener.local_addr()?,
            in_listener.local_addr()?,
            device,
        ));

        Ok(RelayServer {
            xout: OutboundTracker::new(config.pool_size, config.ack_timeout),
            xin: InboundHandler::new(config.payload_len),
            timers: TimerWheel::new(),
            stats_threshold: config.stats_threshold(),
            config,
            console,
            out_listener,
            in_listener,
        })
    }

    fn build_listener(config: &RelayConfig, port: u16) -> anyhow::Result<TcpListener> {
        let socket = match config.host {
            std::net::IpAddr::V4(_) => TcpSocket::new_v4()?,
            std::net::IpAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;

        #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
        if let Some(device) = &config.device {
            socket.bind_device(Some(device.as_bytes()))?;
        }
        #[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
        if config.device.is_some() {
            anyhow::bail!("binding to a network device is not supported on this platform");
        }

        socket.bind(SocketAddr::new(config.host, port))?;
        Ok(socket.listen(config.listen_backlog)?)
    }

    pub fn out_addr(&self) -> io::Result<SocketAddr> {
        self.out_listener.local_addr()
    }

    pub fn in_addr(&self) -> io::Result<SocketAddr> {
        self.in_listener.local_addr()
    }

    /// Serves clients until a fatal error. Peer disconnects are not fatal - the instance
    ///  goes back to accepting.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            let (out_stream, in_stream) = self.accept_both().await?;
            self.run_session(out_stream, in_stream).await?;
        }
    }

    /// The accept phase: waits until both channels have a client. Drop timers from a
    ///  previous session keep firing while we wait. A failed `accept` is recovered by
    ///  rebuilding the listener.
    async fn accept_both(&mut self) -> anyhow::Result<(TcpStream, TcpStream)> {
        let mut out_client: Option<TcpStream> = None;
        let mut in_client: Option<TcpStream> = None;

        loop {
            if out_client.is_some() && in_client.is_some() {
                return Ok((out_client.take().unwrap(), in_client.take().unwrap()));
            }

            let accept = Self::accept_either(
                &self.out_listener,
                &self.in_listener,
                out_client.is_some(),
                in_client.is_some(),
            );
            // bind first: the wait future borrows the listeners and the wheel, and must be
            //  gone before the arms touch them again
            let waited = self.timers.wait(Some(accept)).await;
            match waited {
                Waited::Idle => unreachable!("an I/O future was supplied"),
                Waited::Timer(RelayCommand::DropSlot(idx)) => self.xout.drop_slot(idx),
                Waited::Timer(RelayCommand::SendNext) => {
                    debug!("send timer fired outside a session - not re-arming");
                }
                Waited::Io(Ok((side, stream, peer))) => {
                    info!("new connection on {} from {}", side.label(), peer);
                    self.console
                        .print(&format!("new connection on {} from {}\n", side.label(), peer));
                    match side {
                        ChannelSide::Out => out_client = Some(stream),
                        ChannelSide::In => in_client = Some(stream),
                    }
                }
                Waited::Io(Err((side, e))) => {
                    error!(
                        "accept failed on {}: {} - rebuilding the listener",
                        side.label(),
                        e
                    );
                    let port = match side {
                        ChannelSide::Out => self.config.out_port,
                        ChannelSide::In => self.config.in_port,
                    };
                    let listener = Self::build_listener(&self.config, port)?;
                    match side {
                        ChannelSide::Out => self.out_listener = listener,
                        ChannelSide::In => self.in_listener = listener,
                    }
                }
            }
        }
    }

    async fn accept_either(
        out_listener: &TcpListener,
        in_listener: &TcpListener,
        out_connected: bool,
        in_connected: bool,
    ) -> Result<(ChannelSide, TcpStream, SocketAddr), (ChannelSide, io::Error)> {
        tokio::select! {
            r = out_listener.accept(), if !out_connected => match r {
                Ok((stream, peer)) => Ok((ChannelSide::Out, stream, peer)),
                Err(e) => Err((ChannelSide::Out, e)),
            },
            r = in_listener.accept(), if !in_connected => match r {
                Ok((stream, peer)) => Ok((ChannelSide::In, stream, peer)),
                Err(e) => Err((ChannelSide::In, e)),
            },
        }
    }

    async fn either_readable(
        out_stream: &TcpStream,
        in_stream: &TcpStream,
    ) -> io::Result<ChannelSide> {
        tokio::select! {
            r = out_stream.readable() => r.map(|()| ChannelSide::Out),
            r = in_stream.readable() => r.map(|()| ChannelSide::In),
        }
    }

    /// The message loop for one pair of clients. Exits when either peer closes or fails;
    ///  the streams are closed on return.
    async fn run_session(
        &mut self,
        out_stream: TcpStream,
        in_stream: TcpStream,
    ) -> anyhow::Result<()> {
        info!("both channels connected - starting the message loop");
        self.console.print("both channels connected - starting the message loop\n");

        self.timers
            .register(RelayCommand::SendNext, self.config.send_cadence);

        loop {
            if self.xout.window_sent() >= self.stats_threshold {
                self.emit_statistics();
            }

            let io = Self::either_readable(&out_stream, &in_stream);
            let waited = self.timers.wait(Some(io)).await;
            match waited {
                Waited::Idle => unreachable!("an I/O future was supplied"),
                Waited::Timer(RelayCommand::DropSlot(idx)) => self.xout.drop_slot(idx),
                Waited::Timer(RelayCommand::SendNext) => {
                    let payload = random_payload(self.config.payload_len);
                    match self
                        .xout
                        .send_msg(&out_stream, &mut self.timers, &payload)
                        .await
                    {
                        Ok(()) => {
                            debug!("sent message");
                            self.timers
                                .register(RelayCommand::SendNext, self.config.send_cadence);
                        }
                        Err(e) => warn!("send timer not re-armed: {}", e),
                    }
                }
                Waited::Io(Err(e)) => {
                    error!("waiting for channel readiness failed: {}", e);
                    break;
                }
                Waited::Io(Ok(ChannelSide::Out)) => {
                    match self.xout.recv_ack(&out_stream, &mut self.timers) {
                        Ok(AckStep::PeerClosed) => break,
                        Ok(_) => {}
                        Err(e @ RelayError::NoSuchTimer(_)) => return Err(e.into()),
                        Err(_) => {} // transient recv trouble, already logged by the tracker
                    }
                }
                Waited::Io(Ok(ChannelSide::In)) => match self.xin.echo(&in_stream).await {
                    EchoStep::PeerClosed => break,
                    EchoStep::Echoed | EchoStep::Skipped => {}
                },
            }
        }

        warn!("closing the client session");
        self.console.print("closing the client session\n");
        Ok(())
    }

    /// Emits the statistics table for the window that just ended and resets the counters.
    fn emit_statistics(&mut self) {
        let out = self.xout.take_window();
        let inw = self.xin.take_window();

        let window_secs = self.config.stats_interval.as_secs_f64();
        let lost = out.sent.saturating_sub(out.acks_received);
        let mean_rtt = if out.sent == 0 {
            0
        } else {
            out.rtt_total_micros / out.sent as u64
        };
        let device = self.config.device.as_deref().unwrap_or("-");

        info!("statistics for the last {} s:", window_secs);
        info!("messages sent to the OUT client: {}", out.sent);
        info!("messages received from the IN client: {}", inw.received);
        info!("ACKs received on OUT: {}", out.acks_received);
        info!("ACKs sent on IN: {}", inw.acks_sent);
        info!("ACKs lost on OUT: {}", lost);
        info!("total send-to-ACK time: {} us", out.rtt_total_micros);
        info!("mean send-to-ACK time: {} us", mean_rtt);
        info!("max send-to-ACK time: {} us", out.rtt_max_micros);

        let row = |label: &str, value: String, unit: &str| {
            vec![label.to_string(), value, unit.to_string()]
        };
        let rows = vec![
            row("network device", device.to_string(), ""),
            row("parameter", "value".to_string(), "unit"),
            row("statistics for the last", format!("{}", window_secs), "s"),
            row("messages sent to the OUT client", out.sent.to_string(), "msgs"),
            row("messages received from the IN client", inw.received.to_string(), "msgs"),
            row("ACKs received on OUT", out.acks_received.to_string(), "msgs"),
            row("ACKs sent on IN", inw.acks_sent.to_string(), "msgs"),
            row("ACKs lost on OUT", lost.to_string(), "msgs"),
            row("total send-to-ACK time", out.rtt_total_micros.to_string(), "us"),
            row("mean send-to-ACK time", mean_rtt.to_string(), "us"),
            row("max send-to-ACK time", out.rtt_max_micros.to_string(), "us"),
        ];
        self.console.print(&render_table(&rows));
    }
}

/// Filler payload: printable letters for easy eyeballing in a packet capture, with a NUL
///  terminator in the last byte.
fn random_payload(len: usize) -> Vec<u8> {
    let mut payload = vec![0u8; len];
    let mut rng = rand::thread_rng();
    for byte in &mut payload[..len - 1] {
        let n: u8 = rng.gen_range(0..52);
        *byte = if n < 26 { b'A' + n } else { b'a' + n - 26 };
    }
    payload
}
