//! # Fieldbus Transport Layer
//!
//! A transport owns exactly one connection and serializes every exchange on
//! it through a single async mutex, so the poll loop and command issuance
//! never interleave bytes on the wire.
//!
//! ## Supported Transports
//!
//! ### Serial (`SerialTransport`)
//! - RS-485 line opened through `tokio-serial`, or any attached byte stream
//! - No length prefix on the wire: a response is complete once the line has
//!   been quiet for the silence window after at least one chunk arrived
//! - CRC failures are counted separately and the response is discarded
//!
//! ### TCP (`TcpTransport`)
//! - MBAP-framed, header read first then exactly the announced remainder
//! - Transaction ids come from a counter owned by the transport instance
//!
//! ## Completion by silence
//!
//! ```text
//! write ──► settle delay ──► wait ≤ response timeout for first chunk
//!                               │
//!                               ├─ nothing ──────────────► Timeout
//!                               └─ chunk ─► wait ≤ silence window ─┐
//!                                             ▲      more data     │
//!                                             └────────────────────┤
//!                                                  quiet ─► complete
//! ```
//!
//! The three durations live in [`FrameTiming`](crate::config::FrameTiming)
//! and are tunable per line.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use stepper_cell::config::TcpClientConfig;
//! use stepper_cell::protocol::ModbusRequest;
//! use stepper_cell::transport::{FieldTransport, TcpTransport};
//!
//! # async fn example() -> stepper_cell::CellResult<()> {
//! let transport = TcpTransport::new(TcpClientConfig::default());
//! if transport.open().await {
//!     let response = transport.request(&ModbusRequest::read_input(1, 0, 12)).await?;
//!     println!("status registers: {:?}", response.registers());
//!     println!("tx={} rx={}", transport.get_stats().tx_count, transport.get_stats().rx_count);
//! }
//! transport.close().await;
//! # Ok(())
//! # }
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::checksum;
use crate::config::{Parity, SerialConfig, TcpClientConfig};
use crate::error::{CellError, CellResult};
use crate::logging::EventSink;
use crate::protocol::{self, Framing, MbapHeader, ModbusRequest, ModbusResponse, SlaveId, MBAP_HEADER_LEN};
use crate::utils::{format::bytes_to_hex, OperationTimer};

/// Upper bound on a serial response
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Upper bound on a TCP PDU announced by the MBAP length field
pub const MAX_TCP_PDU_SIZE: usize = 253;

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    /// Frames written, whatever the outcome
    pub tx_count: u64,
    /// Complete, checksum-valid responses
    pub rx_count: u64,
    /// Deadlines that passed with nothing received
    pub timeout_count: u64,
    /// Serial responses discarded for a bad CRC
    pub checksum_errors: u64,
    /// Every other failure, including decode errors and exceptions
    pub error_count: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_tx_frame: Vec<u8>,
    pub last_rx_frame: Vec<u8>,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Local>>,
    pub last_round_trip: Option<Duration>,
}

impl TransportStats {
    /// Percentage of written frames that produced a valid response
    pub fn success_rate(&self) -> f64 {
        if self.tx_count == 0 {
            return 0.0;
        }
        (self.rx_count as f64 / self.tx_count as f64) * 100.0
    }
}

/// Counters shared between a transport and the callers reading them
#[derive(Debug, Default)]
pub struct LinkStats {
    inner: std::sync::Mutex<TransportStats>,
}

impl LinkStats {
    fn update<F: FnOnce(&mut TransportStats)>(&self, f: F) {
        let mut stats = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }

    pub fn snapshot(&self) -> TransportStats {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn record_tx(&self, frame: &[u8]) {
        self.update(|s| {
            s.tx_count += 1;
            s.bytes_sent += frame.len() as u64;
            s.last_tx_frame = frame.to_vec();
        });
    }

    pub fn record_rx(&self, frame: &[u8], round_trip: Duration) {
        self.update(|s| {
            s.rx_count += 1;
            s.bytes_received += frame.len() as u64;
            s.last_rx_frame = frame.to_vec();
            s.last_success = Some(Local::now());
            s.last_round_trip = Some(round_trip);
        });
    }

    pub fn record_timeout(&self, message: &str) {
        self.update(|s| {
            s.timeout_count += 1;
            s.last_error = Some(message.to_string());
        });
    }

    pub fn record_checksum_error(&self, frame: &[u8], message: &str) {
        self.update(|s| {
            s.checksum_errors += 1;
            s.bytes_received += frame.len() as u64;
            s.last_rx_frame = frame.to_vec();
            s.last_error = Some(message.to_string());
        });
    }

    pub fn record_error(&self, message: &str) {
        self.update(|s| {
            s.error_count += 1;
            s.last_error = Some(message.to_string());
        });
    }
}

/// Byte stream a serial transport can drive
pub trait SerialLink: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialLink for T {}

/// Common interface of the serial and TCP transports
///
/// Implementations take `&self`: the connection sits behind the transport's
/// own mutex, so one instance is shared through an `Arc` by every device on
/// the link.
#[async_trait]
pub trait FieldTransport: Send + Sync {
    /// Short label for logs, e.g. the port name or peer address
    fn name(&self) -> &str;

    /// Open the connection; failures are logged and reported as `false`
    async fn open(&self) -> bool;

    fn is_open(&self) -> bool;

    /// Close the connection; safe to call repeatedly
    async fn close(&self);

    /// Framing to stamp on the next request
    fn next_framing(&self) -> Framing;

    /// Write one frame and collect the reply
    ///
    /// # Errors
    ///
    /// - `CellError::ConnectionClosed` - the link is not open
    /// - `CellError::Timeout` - nothing arrived before the deadline
    /// - `CellError::ChecksumMismatch` - serial reply discarded
    async fn transact(&self, frame: &[u8], timeout: Option<Duration>) -> CellResult<Vec<u8>>;

    fn link_stats(&self) -> &LinkStats;

    fn get_stats(&self) -> TransportStats {
        self.link_stats().snapshot()
    }

    /// Encode, exchange and decode one request
    async fn request(&self, request: &ModbusRequest) -> CellResult<ModbusResponse> {
        request.validate()?;
        let framing = self.next_framing();
        let frame = request.encode(framing);
        let reply = self.transact(&frame, None).await?;
        protocol::parse_response(&reply, framing, request).map_err(|e| {
            self.link_stats().record_error(&e.to_string());
            CellError::from(e)
        })
    }

    /// One-register holding read at address 0
    ///
    /// An exception reply still proves the node is alive and counts as success.
    async fn ping(&self, slave_id: SlaveId) -> bool {
        match self.request(&ModbusRequest::read_holding(slave_id, 0x0000, 1)).await {
            Ok(_) => true,
            Err(CellError::Exception { .. }) => true,
            Err(_) => false,
        }
    }
}

fn log_packet(events: &Option<EventSink>, enabled: bool, label: &str, direction: &str, data: &[u8]) {
    if !enabled {
        return;
    }
    debug!("[{}] {} {}", label, direction, bytes_to_hex(data));
    if let Some(sink) = events {
        sink.log_packet(label, direction, data);
    }
}

/// Read until the line goes quiet
///
/// Waits up to `deadline` for the first chunk, then keeps reading while
/// chunks keep arriving within `silence` of each other. Returns an empty
/// buffer when nothing arrived at all.
pub async fn read_until_silence<R>(reader: &mut R, deadline: Duration, silence: Duration) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let started = Instant::now();
    let mut frame = Vec::new();
    let mut chunk = [0u8; 128];

    loop {
        let remaining = deadline.saturating_sub(started.elapsed());
        let wait = if frame.is_empty() { remaining } else { silence.min(remaining) };
        if wait.is_zero() {
            break;
        }
        match timeout(wait, reader.read(&mut chunk)).await {
            Ok(Ok(0)) => {
                if frame.is_empty() {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "link closed by peer"));
                }
                break;
            }
            Ok(Ok(n)) => {
                frame.extend_from_slice(&chunk[..n]);
                if frame.len() >= MAX_RTU_FRAME_SIZE {
                    break;
                }
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => break,
        }
    }

    Ok(frame)
}

/// Drop whatever is already buffered on the line from an earlier exchange
async fn discard_pending<R>(reader: &mut R) -> usize
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut scratch = [0u8; 64];
    let mut dropped = 0;
    while let Ok(Ok(n)) = timeout(Duration::ZERO, reader.read(&mut scratch)).await {
        if n == 0 {
            break;
        }
        dropped += n;
    }
    dropped
}

/// Serial fieldbus transport
pub struct SerialTransport {
    config: SerialConfig,
    port: Mutex<Option<Box<dyn SerialLink>>>,
    open: AtomicBool,
    stats: LinkStats,
    events: Option<EventSink>,
    packet_logging: bool,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            port: Mutex::new(None),
            open: AtomicBool::new(false),
            stats: LinkStats::default(),
            events: None,
            packet_logging: false,
        }
    }

    /// Mirror TX/RX frames into the event sink at debug level
    pub fn with_packet_logging(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self.packet_logging = true;
        self
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Use an already open byte stream as the line
    pub async fn attach<L: SerialLink + 'static>(&self, link: L) {
        *self.port.lock().await = Some(Box::new(link));
        self.open.store(true, Ordering::SeqCst);
    }
}

/// Open a physical serial port with the configured line settings
pub fn open_serial_port(config: &SerialConfig) -> CellResult<tokio_serial::SerialStream> {
    let data_bits = match config.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let stop_bits = match config.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };
    let parity = match config.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    };
    let builder = tokio_serial::new(&config.port, config.baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .timeout(config.timing.response_timeout());
    Ok(tokio_serial::SerialStream::open(&builder)?)
}

#[async_trait]
impl FieldTransport for SerialTransport {
    fn name(&self) -> &str {
        &self.config.port
    }

    async fn open(&self) -> bool {
        let mut port = self.port.lock().await;
        if port.is_some() {
            return true;
        }
        match open_serial_port(&self.config) {
            Ok(stream) => {
                *port = Some(Box::new(stream));
                self.open.store(true, Ordering::SeqCst);
                info!(
                    "Opened serial port {} at {} baud",
                    self.config.port, self.config.baud_rate
                );
                true
            }
            Err(e) => {
                let message = format!("Failed to open serial port {}: {}", self.config.port, e);
                warn!("{}", message);
                self.stats.record_error(&message);
                false
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.port.lock().await.take().is_some() {
            info!("Closed serial port {}", self.config.port);
        }
        self.open.store(false, Ordering::SeqCst);
    }

    fn next_framing(&self) -> Framing {
        Framing::Rtu
    }

    async fn transact(&self, frame: &[u8], deadline: Option<Duration>) -> CellResult<Vec<u8>> {
        let timing = self.config.timing;
        let deadline = deadline.unwrap_or_else(|| timing.response_timeout());

        let mut guard = self.port.lock().await;
        let port = guard.as_mut().ok_or_else(|| {
            CellError::connection_closed(format!("serial port {} is not open", self.config.port))
        })?;

        let stale = discard_pending(port).await;
        if stale > 0 {
            debug!("[{}] discarded {} stale bytes", self.config.port, stale);
        }

        self.stats.record_tx(frame);
        log_packet(&self.events, self.packet_logging, &self.config.port, "TX", frame);

        let timer = OperationTimer::start("serial transaction");
        let written = async {
            port.write_all(frame).await?;
            port.flush().await
        };
        if let Err(e) = written.await {
            let err = CellError::from(e);
            self.stats.record_error(&err.to_string());
            return Err(err);
        }

        tokio::time::sleep(timing.settle_delay()).await;

        let reply = match read_until_silence(port, deadline, timing.silence_window()).await {
            Ok(reply) => reply,
            Err(e) => {
                let err = CellError::from(e);
                self.stats.record_error(&err.to_string());
                return Err(err);
            }
        };

        if reply.is_empty() {
            let err = CellError::timeout(
                format!("no response on {}", self.config.port),
                deadline.as_millis() as u64,
            );
            self.stats.record_timeout(&err.to_string());
            return Err(err);
        }

        log_packet(&self.events, self.packet_logging, &self.config.port, "RX", &reply);

        if !checksum::verify(&reply) {
            let expected = checksum::compute(&reply[..reply.len().saturating_sub(2)]);
            let actual = checksum::trailer(&reply).unwrap_or_default();
            let err = CellError::checksum_mismatch(expected, actual);
            warn!("[{}] {} in {}", self.config.port, err, bytes_to_hex(&reply));
            self.stats.record_checksum_error(&reply, &err.to_string());
            return Err(err);
        }

        self.stats.record_rx(&reply, timer.stop());
        Ok(reply)
    }

    fn link_stats(&self) -> &LinkStats {
        &self.stats
    }
}

/// Modbus TCP client transport
pub struct TcpTransport {
    config: TcpClientConfig,
    stream: Mutex<Option<TcpStream>>,
    open: AtomicBool,
    transaction_id: AtomicU16,
    stats: LinkStats,
    events: Option<EventSink>,
    packet_logging: bool,
}

impl TcpTransport {
    pub fn new(config: TcpClientConfig) -> Self {
        Self {
            config,
            stream: Mutex::new(None),
            open: AtomicBool::new(false),
            transaction_id: AtomicU16::new(0),
            stats: LinkStats::default(),
            events: None,
            packet_logging: false,
        }
    }

    /// Mirror TX/RX frames into the event sink at debug level
    pub fn with_packet_logging(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self.packet_logging = true;
        self
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// Next transaction id; wraps and skips 0
    fn next_transaction_id(&self) -> u16 {
        loop {
            let id = self.transaction_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Forget a stream that may be left mid-frame
    fn drop_stream(&self, guard: &mut Option<TcpStream>) {
        *guard = None;
        self.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl FieldTransport for TcpTransport {
    fn name(&self) -> &str {
        &self.config.address
    }

    async fn open(&self) -> bool {
        let mut stream = self.stream.lock().await;
        if stream.is_some() {
            return true;
        }
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let message = match timeout(connect_timeout, TcpStream::connect(&self.config.address)).await {
            Ok(Ok(socket)) => {
                let _ = socket.set_nodelay(true);
                *stream = Some(socket);
                self.open.store(true, Ordering::SeqCst);
                info!("Connected to {}", self.config.address);
                return true;
            }
            Ok(Err(e)) => format!("Failed to connect to {}: {}", self.config.address, e),
            Err(_) => format!(
                "Connecting to {} timed out after {}ms",
                self.config.address, self.config.connect_timeout_ms
            ),
        };
        warn!("{}", message);
        self.stats.record_error(&message);
        false
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
            info!("Disconnected from {}", self.config.address);
        }
        self.open.store(false, Ordering::SeqCst);
    }

    fn next_framing(&self) -> Framing {
        Framing::Tcp {
            transaction_id: self.next_transaction_id(),
        }
    }

    async fn transact(&self, frame: &[u8], deadline: Option<Duration>) -> CellResult<Vec<u8>> {
        let deadline = deadline.unwrap_or(Duration::from_millis(self.config.response_timeout_ms));
        let deadline_ms = deadline.as_millis() as u64;

        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| {
            CellError::connection_closed(format!("not connected to {}", self.config.address))
        })?;

        self.stats.record_tx(frame);
        log_packet(&self.events, self.packet_logging, &self.config.address, "TX", frame);
        let timer = OperationTimer::start("tcp transaction");

        if let Err(e) = stream.write_all(frame).await {
            let err = CellError::from(e);
            self.stats.record_error(&err.to_string());
            self.drop_stream(&mut guard);
            return Err(err);
        }

        let mut reply = vec![0u8; MBAP_HEADER_LEN];
        let header = match timeout(deadline, stream.read_exact(&mut reply)).await {
            Ok(Ok(_)) => MbapHeader::parse(&reply)?,
            Ok(Err(e)) => {
                let err = CellError::from(e);
                self.stats.record_error(&err.to_string());
                self.drop_stream(&mut guard);
                return Err(err);
            }
            Err(_) => {
                let err = CellError::timeout(format!("no response from {}", self.config.address), deadline_ms);
                self.stats.record_timeout(&err.to_string());
                self.drop_stream(&mut guard);
                return Err(err);
            }
        };

        let remaining = header.pdu_len();
        if remaining == 0 || remaining > MAX_TCP_PDU_SIZE {
            let err = CellError::malformed(format!("MBAP length {} out of range", header.length));
            self.stats.record_error(&err.to_string());
            self.drop_stream(&mut guard);
            return Err(err);
        }

        reply.resize(MBAP_HEADER_LEN + remaining, 0);
        match timeout(deadline, stream.read_exact(&mut reply[MBAP_HEADER_LEN..])).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                let err = CellError::from(e);
                self.stats.record_error(&err.to_string());
                self.drop_stream(&mut guard);
                return Err(err);
            }
            Err(_) => {
                let err = CellError::timeout(format!("truncated response from {}", self.config.address), deadline_ms);
                self.stats.record_timeout(&err.to_string());
                self.drop_stream(&mut guard);
                return Err(err);
            }
        }

        log_packet(&self.events, self.packet_logging, &self.config.address, "RX", &reply);
        self.stats.record_rx(&reply, timer.stop());
        Ok(reply)
    }

    fn link_stats(&self) -> &LinkStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrameTiming;
    use tokio::io::{duplex, DuplexStream};

    fn fast_serial() -> SerialTransport {
        SerialTransport::new(SerialConfig {
            port: "sim0".to_string(),
            timing: FrameTiming {
                response_timeout_ms: 150,
                settle_delay_ms: 1,
                silence_window_ms: 20,
            },
            ..SerialConfig::default()
        })
    }

    /// Answer every request on `line` with `reply(request)`
    fn spawn_node<F>(mut line: DuplexStream, reply: F)
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                let n = match line.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                if let Some(answer) = reply(&buf[..n]) {
                    if line.write_all(&answer).await.is_err() {
                        return;
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn test_read_until_silence_joins_chunks() {
        let (mut near, mut far) = duplex(256);
        tokio::spawn(async move {
            far.write_all(&[0x01, 0x03]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            far.write_all(&[0x02, 0x00, 0x2A]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            far.write_all(&[0xFF]).await.unwrap();
        });

        let frame = read_until_silence(&mut near, Duration::from_millis(500), Duration::from_millis(40))
            .await
            .unwrap();
        assert_eq!(frame, vec![0x01, 0x03, 0x02, 0x00, 0x2A]);
    }

    #[tokio::test]
    async fn test_read_until_silence_empty_on_deadline() {
        let (mut near, _far) = duplex(64);
        let frame = read_until_silence(&mut near, Duration::from_millis(50), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(frame.is_empty());
    }

    #[tokio::test]
    async fn test_serial_request_round_trip() {
        let transport = fast_serial();
        let (near, far) = duplex(256);
        spawn_node(far, |request| {
            assert_eq!(request, &protocol::build_read_holding(Framing::Rtu, 2, 0x1010, 1)[..]);
            Some(protocol::wrap_pdu(Framing::Rtu, 2, &[0x03, 0x02, 0x00, 0x10]))
        });
        transport.attach(near).await;

        let response = transport
            .request(&ModbusRequest::read_holding(2, 0x1010, 1))
            .await
            .unwrap();
        assert_eq!(response.registers(), &[0x0010]);

        let stats = transport.get_stats();
        assert_eq!(stats.tx_count, 1);
        assert_eq!(stats.rx_count, 1);
        assert!(stats.last_success.is_some());
    }

    #[tokio::test]
    async fn test_serial_checksum_error_is_counted_separately() {
        let transport = fast_serial();
        let (near, far) = duplex(256);
        spawn_node(far, |_| {
            let mut reply = protocol::wrap_pdu(Framing::Rtu, 1, &[0x04, 0x04, 0x00, 0xFA, 0x02, 0x58]);
            let last = reply.len() - 1;
            reply[last] ^= 0xFF;
            Some(reply)
        });
        transport.attach(near).await;

        let result = transport.request(&ModbusRequest::read_input(1, 1, 2)).await;
        assert!(matches!(result, Err(CellError::ChecksumMismatch { .. })));

        let stats = transport.get_stats();
        assert_eq!(stats.tx_count, 1);
        assert_eq!(stats.rx_count, 0);
        assert_eq!(stats.checksum_errors, 1);
        assert_eq!(stats.timeout_count, 0);
    }

    #[tokio::test]
    async fn test_serial_silence_is_a_timeout() {
        let transport = fast_serial();
        let (near, far) = duplex(256);
        spawn_node(far, |_| None);
        transport.attach(near).await;

        let result = transport.transact(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A], None).await;
        assert!(matches!(result, Err(CellError::Timeout { .. })));
        assert_eq!(transport.get_stats().timeout_count, 1);
        assert!(!transport.ping(1).await);
        assert_eq!(transport.get_stats().timeout_count, 2);
    }

    #[tokio::test]
    async fn test_ping_accepts_exception_reply() {
        let transport = fast_serial();
        let (near, far) = duplex(256);
        spawn_node(far, |_| Some(protocol::wrap_pdu(Framing::Rtu, 5, &[0x83, 0x02])));
        transport.attach(near).await;
        assert!(transport.ping(5).await);
    }

    #[tokio::test]
    async fn test_closed_transport_fails_fast() {
        let transport = fast_serial();
        assert!(!transport.is_open());
        let result = transport.transact(&[0x01], None).await;
        assert!(matches!(result, Err(CellError::ConnectionClosed { .. })));
        assert_eq!(transport.get_stats().tx_count, 0);

        transport.close().await;
        transport.close().await;
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_transaction_ids_are_per_instance() {
        let a = TcpTransport::new(TcpClientConfig::default());
        let b = TcpTransport::new(TcpClientConfig::default());
        assert_eq!(a.next_framing(), Framing::Tcp { transaction_id: 1 });
        assert_eq!(a.next_framing(), Framing::Tcp { transaction_id: 2 });
        assert_eq!(b.next_framing(), Framing::Tcp { transaction_id: 1 });

        a.transaction_id.store(u16::MAX - 1, Ordering::Relaxed);
        assert_eq!(a.next_transaction_id(), u16::MAX);
        assert_eq!(a.next_transaction_id(), 1);
    }

    #[tokio::test]
    async fn test_tcp_open_failure_reports_false() {
        let transport = TcpTransport::new(TcpClientConfig {
            address: "127.0.0.1:1".to_string(),
            connect_timeout_ms: 200,
            response_timeout_ms: 200,
        });
        assert!(!transport.open().await);
        assert!(!transport.is_open());
        assert_eq!(transport.get_stats().error_count, 1);
    }

    /// Accept one connection per entry; each reads a 12-byte request and
    /// gets `replies[i](request)` back before its socket is closed. A `None`
    /// reply keeps the socket open and silent until the next peer arrives.
    fn spawn_tcp_peers(listener: tokio::net::TcpListener, replies: Vec<fn(&[u8]) -> Option<Vec<u8>>>) {
        tokio::spawn(async move {
            let mut held = Vec::new();
            for reply in replies {
                let (mut peer, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let mut request = [0u8; 12];
                if peer.read_exact(&mut request).await.is_err() {
                    return;
                }
                match reply(&request) {
                    Some(bytes) => {
                        let _ = peer.write_all(&bytes).await;
                    }
                    None => held.push(peer),
                }
            }
        });
    }

    /// Holding register 0 = 42, echoing the request's ids
    fn answer_42(request: &[u8]) -> Option<Vec<u8>> {
        let mut reply = request[..4].to_vec();
        reply.extend_from_slice(&[0x00, 0x05, request[6], 0x03, 0x02, 0x00, 0x2A]);
        Some(reply)
    }

    fn silent(_request: &[u8]) -> Option<Vec<u8>> {
        None
    }

    fn short_header(request: &[u8]) -> Option<Vec<u8>> {
        Some(request[..3].to_vec())
    }

    async fn tcp_client(addr: std::net::SocketAddr) -> TcpTransport {
        let transport = TcpTransport::new(TcpClientConfig {
            address: addr.to_string(),
            connect_timeout_ms: 500,
            response_timeout_ms: 100,
        });
        assert!(transport.open().await);
        transport
    }

    #[tokio::test]
    async fn test_tcp_timeout_drops_stream_until_reopened() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        spawn_tcp_peers(listener, vec![silent, answer_42]);

        let transport = tcp_client(addr).await;
        let request = ModbusRequest::read_holding(1, 0, 1);
        let err = transport.request(&request).await.unwrap_err();
        assert!(matches!(err, CellError::Timeout { .. }));
        assert!(!transport.is_open());
        let stats = transport.get_stats();
        assert_eq!((stats.tx_count, stats.rx_count, stats.timeout_count), (1, 0, 1));

        let err = transport.request(&request).await.unwrap_err();
        assert!(matches!(err, CellError::ConnectionClosed { .. }));
        assert_eq!(transport.get_stats().tx_count, 1);

        assert!(transport.open().await);
        let response = transport.request(&request).await.unwrap();
        assert_eq!(response.registers(), &[42]);
        let stats = transport.get_stats();
        assert_eq!((stats.tx_count, stats.rx_count, stats.timeout_count), (2, 1, 1));
    }

    #[tokio::test]
    async fn test_tcp_truncated_header_drops_stream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        spawn_tcp_peers(listener, vec![short_header, answer_42]);

        let transport = tcp_client(addr).await;
        let request = ModbusRequest::read_holding(1, 0, 1);
        let err = transport.request(&request).await.unwrap_err();
        assert!(matches!(err, CellError::ConnectionClosed { .. }));
        assert!(!transport.is_open());
        let stats = transport.get_stats();
        assert_eq!((stats.error_count, stats.timeout_count, stats.rx_count), (1, 0, 0));

        assert!(transport.open().await);
        assert_eq!(transport.request(&request).await.unwrap().registers(), &[42]);
        assert_eq!(transport.get_stats().error_count, 1);
    }
}
