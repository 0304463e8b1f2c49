use std::{
    io::{self, BufRead, BufReader},
    mem,
    net::{TcpStream, ToSocketAddrs},
    ops::Range,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use rand::{seq::SliceRandom, Rng};
use tracing::{debug, info, warn};
use tungstenite::{
    client::{client_with_config, IntoClientRequest},
    protocol::WebSocketConfig,
    HandshakeError, Message, WebSocket,
};

use crate::{
    config::IngestConfig, error::DashboardError, threads::ThreadManager, types::PacketEvent,
};

const READ_TIMEOUT: Duration = Duration::from_millis(250);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Longest packet event accepted, as a line or as a WebSocket message.
pub const MAX_EVENT_BYTES: usize = 64 * 1024;

/// Addresses the mock source picks from.
pub const MOCK_ADDRESSES: [&str; 7] = [
    "192.168.1.1",
    "47.103.24.173",
    "220.181.38.148",
    "139.159.241.37",
    "203.205.254.157",
    "123.151.137.18",
    "183.3.226.35",
];

#[derive(Debug, Default)]
pub struct IngestStats {
    pub events: AtomicU64,
    pub malformed: AtomicU64,
    pub connections: AtomicU64,
}

enum StreamEnd {
    Closed,
    Stopped,
}

/// A capture process endpoint and how its events are framed.
enum Source {
    WebSocket(String),
    Lines(String),
}

impl Source {
    fn endpoint(&self) -> &str {
        match self {
            Source::WebSocket(url) => url,
            Source::Lines(endpoint) => endpoint,
        }
    }

    /// Connects once and reads until the stream ends or ingest is stopped.
    fn consume(
        &self,
        exit: &AtomicBool,
        sender: &Sender<PacketEvent>,
        stats: &IngestStats,
    ) -> Result<StreamEnd, DashboardError> {
        match self {
            Source::WebSocket(url) => {
                let socket = open_websocket(url, exit)?;
                stats.connections.fetch_add(1, Ordering::Relaxed);
                info!("Connected to ingest endpoint {}", url);
                read_frames(socket, exit, sender, stats)
            }
            Source::Lines(endpoint) => {
                let stream = connect(endpoint.as_str())?;
                stats.connections.fetch_add(1, Ordering::Relaxed);
                info!("Connected to ingest endpoint {}", endpoint);
                read_lines(stream, exit, sender, stats)
            }
        }
    }
}

/// Starts the ingest worker described by `config`, feeding `sender`.
pub fn spawn_ingest(
    thread_manager: &mut ThreadManager,
    config: &IngestConfig,
    sender: Sender<PacketEvent>,
    stats: Arc<IngestStats>,
) -> Result<(), DashboardError> {
    match config.clone() {
        IngestConfig::WebSocket {
            url,
            reconnect_delay,
        } => {
            info!("Reading packet events from {}", url);
            thread_manager.spawn("ingest_ws", move |exit, shutdown_rx| {
                run_remote_ingest(
                    exit,
                    shutdown_rx,
                    Source::WebSocket(url),
                    reconnect_delay,
                    sender,
                    stats,
                );
            })
        }
        IngestConfig::Tcp {
            endpoint,
            reconnect_delay,
        } => {
            info!("Reading packet events from {}", endpoint);
            thread_manager.spawn("ingest_tcp", move |exit, shutdown_rx| {
                run_remote_ingest(
                    exit,
                    shutdown_rx,
                    Source::Lines(endpoint),
                    reconnect_delay,
                    sender,
                    stats,
                );
            })
        }
        IngestConfig::Mock { interval_range } => {
            info!("Generating mock packet events");
            thread_manager.spawn("ingest_mock", move |exit, shutdown_rx| {
                run_mock_ingest(exit, shutdown_rx, interval_range, sender, stats);
            })
        }
    }
}

fn run_remote_ingest(
    exit: Arc<AtomicBool>,
    shutdown_rx: Receiver<()>,
    source: Source,
    reconnect_delay: Duration,
    sender: Sender<PacketEvent>,
    stats: Arc<IngestStats>,
) {
    let endpoint = source.endpoint();
    while !exit.load(Ordering::Relaxed) {
        match source.consume(&exit, &sender, &stats) {
            Ok(StreamEnd::Stopped) => break,
            Ok(StreamEnd::Closed) => info!("Ingest stream {} closed", endpoint),
            Err(e) => warn!("Ingest stream {} failed: {}", endpoint, e),
        }

        crossbeam_channel::select! {
            recv(shutdown_rx) -> _ => break,
            default(reconnect_delay) => {}
        }
    }
    info!("Exiting ingest thread");
}

/// Tries each resolved address in turn, bounded by `CONNECT_TIMEOUT`.
fn connect<A: ToSocketAddrs>(address: A) -> Result<TcpStream, DashboardError> {
    let mut last_error = None;
    for addr in address.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                stream.set_read_timeout(Some(READ_TIMEOUT))?;
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    let error = last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "endpoint resolved to no addresses")
    });
    Err(error.into())
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

fn open_websocket(url: &str, exit: &AtomicBool) -> Result<WebSocket<TcpStream>, DashboardError> {
    let request = url.into_client_request()?;
    let host = request
        .uri()
        .host()
        .map(|host| host.trim_start_matches('[').trim_end_matches(']').to_string())
        .ok_or_else(|| DashboardError::Config(format!("ingest url {url} has no host")))?;
    let port = request.uri().port_u16().unwrap_or(80);
    let stream = connect((host.as_str(), port))?;

    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_EVENT_BYTES);
    config.max_frame_size = Some(MAX_EVENT_BYTES);

    // The stream already has a read timeout, so the handshake is resumed
    // until it completes or the deadline passes.
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    let mut handshake = client_with_config(request, stream, Some(config));
    loop {
        match handshake {
            Ok((socket, _response)) => return Ok(socket),
            Err(HandshakeError::Interrupted(mid)) => {
                if exit.load(Ordering::Relaxed) || Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "WebSocket handshake did not complete",
                    )
                    .into());
                }
                handshake = mid.handshake();
            }
            Err(HandshakeError::Failure(e)) => return Err(e.into()),
        }
    }
}

fn read_frames(
    mut socket: WebSocket<TcpStream>,
    exit: &AtomicBool,
    sender: &Sender<PacketEvent>,
    stats: &IngestStats,
) -> Result<StreamEnd, DashboardError> {
    loop {
        if exit.load(Ordering::Relaxed) {
            let _ = socket.close(None);
            let _ = socket.flush();
            return Ok(StreamEnd::Stopped);
        }

        let delivered = match socket.read() {
            Ok(Message::Text(text)) => handle_line(text.as_bytes(), sender, stats),
            Ok(Message::Binary(data)) => handle_line(&data, sender, stats),
            Ok(Message::Close(frame)) => {
                debug!("Ingest peer closed the stream: {:?}", frame);
                let _ = socket.flush();
                return Ok(StreamEnd::Closed);
            }
            // Pings are answered on the next read.
            Ok(_) => true,
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                return Ok(StreamEnd::Closed)
            }
            Err(tungstenite::Error::Io(e)) if is_transient(&e) => true,
            Err(e) => return Err(e.into()),
        };
        if !delivered {
            return Ok(StreamEnd::Stopped);
        }
    }
}

fn read_lines(
    stream: TcpStream,
    exit: &AtomicBool,
    sender: &Sender<PacketEvent>,
    stats: &IngestStats,
) -> Result<StreamEnd, DashboardError> {
    let mut reader = LineReader::new(BufReader::new(stream), MAX_EVENT_BYTES);

    loop {
        if exit.load(Ordering::Relaxed) {
            return Ok(StreamEnd::Stopped);
        }

        match reader.read_line() {
            Ok(LineRead::Line(line)) => {
                if !handle_line(&line, sender, stats) {
                    return Ok(StreamEnd::Stopped);
                }
            }
            Ok(LineRead::Oversized) => {
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("Discarding packet event longer than {} bytes", MAX_EVENT_BYTES);
            }
            Ok(LineRead::Eof) => return Ok(StreamEnd::Closed),
            Err(e) if is_transient(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

#[derive(Debug, PartialEq)]
enum LineRead {
    Line(Vec<u8>),
    /// A line grew past the cap. The rest of it, up to the next newline, is
    /// skipped.
    Oversized,
    Eof,
}

/// Newline framing with a bounded line buffer.
///
/// A partial line survives read timeouts, so a line split across reads is
/// reassembled.
struct LineReader<R> {
    inner: R,
    line: Vec<u8>,
    max_len: usize,
    discarding: bool,
}

impl<R: BufRead> LineReader<R> {
    fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner,
            line: Vec::with_capacity(512),
            max_len,
            discarding: false,
        }
    }

    fn read_line(&mut self) -> io::Result<LineRead> {
        loop {
            let available = self.inner.fill_buf()?;
            if available.is_empty() {
                if self.discarding || self.line.is_empty() {
                    return Ok(LineRead::Eof);
                }
                return Ok(LineRead::Line(mem::take(&mut self.line)));
            }

            let newline = available.iter().position(|b| *b == b'\n');
            let used = newline.map_or(available.len(), |i| i + 1);
            let mut oversized = false;
            if self.discarding {
                self.discarding = newline.is_none();
            } else {
                self.line.extend_from_slice(&available[..used]);
                if self.line.len() > self.max_len {
                    self.line.clear();
                    self.discarding = newline.is_none();
                    oversized = true;
                }
            }
            self.inner.consume(used);

            if oversized {
                return Ok(LineRead::Oversized);
            }
            if newline.is_some() && !self.line.is_empty() {
                return Ok(LineRead::Line(mem::take(&mut self.line)));
            }
        }
    }
}

/// Returns false once the aggregator side has gone away.
fn handle_line(line: &[u8], sender: &Sender<PacketEvent>, stats: &IngestStats) -> bool {
    let line = line.trim_ascii();
    if line.is_empty() {
        return true;
    }

    match PacketEvent::from_json(line) {
        Ok(event) => {
            stats.events.fetch_add(1, Ordering::Relaxed);
            sender.send(event).is_ok()
        }
        Err(e) => {
            stats.malformed.fetch_add(1, Ordering::Relaxed);
            debug!("Skipping malformed packet event: {}", e);
            true
        }
    }
}

fn run_mock_ingest(
    exit: Arc<AtomicBool>,
    shutdown_rx: Receiver<()>,
    interval_range: Range<Duration>,
    sender: Sender<PacketEvent>,
    stats: Arc<IngestStats>,
) {
    let mut rng = rand::thread_rng();

    while !exit.load(Ordering::Relaxed) {
        if sender.send(mock_event(&mut rng)).is_err() {
            break;
        }
        stats.events.fetch_add(1, Ordering::Relaxed);

        let delay = rng.gen_range(interval_range.clone());
        crossbeam_channel::select! {
            recv(shutdown_rx) -> _ => break,
            default(delay) => {}
        }
    }
    info!("Exiting mock ingest thread");
}

/// One synthetic IPv4 packet with a long-tailed size, `round(e^(10u))`.
pub fn mock_event<R: Rng>(rng: &mut R) -> PacketEvent {
    let source = MOCK_ADDRESSES.choose(rng).copied().unwrap_or(MOCK_ADDRESSES[0]);
    let dest = MOCK_ADDRESSES.choose(rng).copied().unwrap_or(MOCK_ADDRESSES[0]);
    let size = (rng.gen::<f64>() * 10.0).exp().round() as u64;
    PacketEvent::ipv4(source, dest, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Transport;
    use rand::{rngs::StdRng, SeedableRng};
    use std::{io::Cursor, net::TcpListener};

    #[test]
    fn handle_line_counts_good_and_bad_lines() {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let stats = IngestStats::default();

        assert!(handle_line(
            b"{\"transport\":{\"type\":\"ipv4\",\"source\":\"1.1.1.1\",\"dest\":\"2.2.2.2\"},\"size\":60}\r\n",
            &sender,
            &stats
        ));
        assert!(handle_line(b"garbage\n", &sender, &stats));
        assert!(handle_line(b"   \n", &sender, &stats));

        assert_eq!(stats.events.load(Ordering::Relaxed), 1);
        assert_eq!(stats.malformed.load(Ordering::Relaxed), 1);
        assert_eq!(receiver.try_recv().unwrap().size, 60);
        assert!(receiver.try_recv().is_err());

        drop(receiver);
        assert!(!handle_line(
            b"{\"transport\":{\"type\":\"arp\",\"op\":2},\"size\":42}",
            &sender,
            &stats
        ));
    }

    #[test]
    fn mock_events_use_known_addresses() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let event = mock_event(&mut rng);
            assert!(event.size >= 1 && event.size <= 22_027);
            match event.transport {
                Transport::Ipv4 { source, dest } => {
                    assert!(MOCK_ADDRESSES.contains(&source.as_str()));
                    assert!(MOCK_ADDRESSES.contains(&dest.as_str()));
                }
                other => panic!("unexpected transport {other:?}"),
            }
        }
    }

    #[test]
    fn line_reader_discards_oversized_lines() {
        let mut input = b"short\n".to_vec();
        input.extend(std::iter::repeat(b'x').take(40));
        input.extend_from_slice(b"\nok\ntail");

        // A tiny buffer makes every line span several fills.
        let mut reader = LineReader::new(BufReader::with_capacity(4, Cursor::new(input)), 16);
        assert_eq!(reader.read_line().unwrap(), LineRead::Line(b"short\n".to_vec()));
        assert_eq!(reader.read_line().unwrap(), LineRead::Oversized);
        assert_eq!(reader.read_line().unwrap(), LineRead::Line(b"ok\n".to_vec()));
        assert_eq!(reader.read_line().unwrap(), LineRead::Line(b"tail".to_vec()));
        assert_eq!(reader.read_line().unwrap(), LineRead::Eof);
    }

    #[test]
    fn line_reader_stops_at_eof_inside_oversized_line() {
        let input = vec![b'y'; 100];
        let mut reader = LineReader::new(Cursor::new(input), 16);
        assert_eq!(reader.read_line().unwrap(), LineRead::Oversized);
        assert_eq!(reader.read_line().unwrap(), LineRead::Eof);
    }

    #[test]
    fn connect_sets_read_timeout_and_reports_refusal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();

        let stream = connect(address).unwrap();
        assert_eq!(stream.read_timeout().unwrap(), Some(READ_TIMEOUT));
        drop(stream);
        drop(listener);

        let started = Instant::now();
        assert!(matches!(connect(address), Err(DashboardError::Io(_))));
        assert!(started.elapsed() < CONNECT_TIMEOUT);
    }
}
