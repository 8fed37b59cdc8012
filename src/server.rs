/// Virtual slave: a Modbus TCP listener standing in for field hardware
///
/// Every accepted connection gets its own handler task. A handler reads one
/// MBAP frame at a time, checks the protocol id, executes the request against
/// the register bank of the addressed unit and answers with the original
/// transaction id. Unsupported function codes get an exception reply and the
/// connection stays open.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use log::{info, error, debug, warn};

use crate::error::{CellError, CellResult};
use crate::protocol::{
    exception_pdu, wrap_pdu, Framing, MbapHeader, ModbusException, ModbusFunction, ModbusRequest,
    ModbusResponse, SlaveId, MBAP_HEADER_LEN,
};
use crate::register_bank::{BankCapacity, ModbusRegisterBank};

/// Largest PDU a request may announce
const MAX_REQUEST_PDU: usize = 253;

/// Modbus server trait
#[async_trait]
pub trait ModbusServer: Send + Sync {
    /// Bind and start accepting; returns the bound address
    async fn start(&mut self) -> CellResult<SocketAddr>;

    /// Stop accepting and close every client handler
    async fn stop(&mut self) -> CellResult<()>;

    fn is_running(&self) -> bool;

    fn get_stats(&self) -> ServerStats;

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Server statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub connections_count: u64,
    pub active_connections: usize,
    pub request_count: u64,
    pub response_count: u64,
    pub error_count: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub last_client: Option<SocketAddr>,
    pub last_request_time: Option<DateTime<Local>>,
    pub uptime_seconds: u64,
}

/// Register banks addressed by unit id
///
/// Either one bank per unit, created on first access, or a single bank that
/// answers for every unit id (the field controller's own interface).
#[derive(Debug)]
pub struct NodeBanks {
    shared: Option<Arc<ModbusRegisterBank>>,
    nodes: RwLock<HashMap<SlaveId, Arc<ModbusRegisterBank>>>,
    capacity: BankCapacity,
}

impl NodeBanks {
    pub fn per_node(capacity: BankCapacity) -> Self {
        Self {
            shared: None,
            nodes: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn shared(bank: Arc<ModbusRegisterBank>) -> Self {
        Self {
            capacity: bank.capacity(),
            shared: Some(bank),
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Bank for `unit_id`, created empty when first addressed
    pub fn bank(&self, unit_id: SlaveId) -> Arc<ModbusRegisterBank> {
        if let Some(shared) = &self.shared {
            return shared.clone();
        }
        if let Some(bank) = self.nodes.read().unwrap_or_else(|e| e.into_inner()).get(&unit_id) {
            return bank.clone();
        }
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes
            .entry(unit_id)
            .or_insert_with(|| Arc::new(ModbusRegisterBank::with_capacity(self.capacity)))
            .clone()
    }

    /// Unit ids that have a dedicated bank
    pub fn unit_ids(&self) -> Vec<SlaveId> {
        let mut ids: Vec<SlaveId> = self
            .nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for NodeBanks {
    fn default() -> Self {
        Self::per_node(BankCapacity::field_node())
    }
}

/// Execute a decoded request against a bank
pub fn execute(bank: &ModbusRegisterBank, request: &ModbusRequest) -> ModbusResponse {
    let registers = match request.function {
        ModbusFunction::ReadHoldingRegisters => {
            bank.read_holding_registers(request.address, request.quantity)
        }
        ModbusFunction::ReadInputRegisters => {
            bank.read_input_registers(request.address, request.quantity)
        }
        ModbusFunction::WriteSingleRegister | ModbusFunction::WriteMultipleRegisters => {
            bank.write_holding_registers(request.address, &request.values);
            Vec::new()
        }
    };
    ModbusResponse::for_request(request, registers)
}

/// Answer one request PDU addressed to `unit_id`
///
/// Returns the reply PDU and whether it is an exception.
pub fn process_pdu(banks: &NodeBanks, unit_id: SlaveId, pdu: &[u8]) -> (Vec<u8>, bool) {
    match ModbusRequest::from_pdu(unit_id, pdu) {
        Ok(request) => {
            let bank = banks.bank(unit_id);
            (execute(&bank, &request).to_pdu(), false)
        }
        Err(exception) => {
            let function_code = pdu.first().copied().unwrap_or(0);
            (exception_pdu(function_code, exception), true)
        }
    }
}

/// Virtual slave configuration
#[derive(Debug, Clone)]
pub struct VirtualSlaveConfig {
    pub bind_address: String,
    pub max_connections: usize,
    /// A client silent for this long is disconnected
    pub idle_timeout: Duration,
}

impl Default for VirtualSlaveConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:502".to_string(),
            max_connections: 16,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Modbus TCP virtual slave
pub struct VirtualSlaveServer {
    config: VirtualSlaveConfig,
    banks: Arc<NodeBanks>,
    stats: Arc<std::sync::Mutex<ServerStats>>,
    active: Arc<AtomicUsize>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    is_running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    start_time: Option<Instant>,
}

impl VirtualSlaveServer {
    pub fn new(config: VirtualSlaveConfig, banks: Arc<NodeBanks>) -> Self {
        Self {
            config,
            banks,
            stats: Arc::new(std::sync::Mutex::new(ServerStats::default())),
            active: Arc::new(AtomicUsize::new(0)),
            shutdown_tx: None,
            is_running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            start_time: None,
        }
    }

    pub fn banks(&self) -> Arc<NodeBanks> {
        self.banks.clone()
    }

    fn update_stats<F: FnOnce(&mut ServerStats)>(stats: &std::sync::Mutex<ServerStats>, f: F) {
        let mut stats = stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }

    /// Read one frame; `Ok(None)` when the client closed cleanly
    async fn read_frame(stream: &mut TcpStream) -> CellResult<Option<(MbapHeader, Vec<u8>)>> {
        let mut header = [0u8; MBAP_HEADER_LEN];
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let header = MbapHeader::parse(&header)?;
        let pdu_len = header.pdu_len();
        if pdu_len == 0 || pdu_len > MAX_REQUEST_PDU {
            return Err(CellError::malformed(format!("MBAP length {} out of range", header.length)));
        }
        let mut pdu = vec![0u8; pdu_len];
        stream.read_exact(&mut pdu).await?;
        Ok(Some((header, pdu)))
    }

    async fn handle_client(
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        banks: Arc<NodeBanks>,
        stats: Arc<std::sync::Mutex<ServerStats>>,
        mut shutdown_rx: broadcast::Receiver<()>,
        idle_timeout: Duration,
    ) {
        info!("New client connected: {}", peer_addr);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Shutdown signal received for client {}", peer_addr);
                    break;
                }

                result = timeout(idle_timeout, Self::read_frame(&mut stream)) => {
                    let (header, pdu) = match result {
                        Ok(Ok(Some(frame))) => frame,
                        Ok(Ok(None)) => break,
                        Ok(Err(e)) => {
                            warn!("Dropping client {}: {}", peer_addr, e);
                            break;
                        }
                        Err(_) => {
                            warn!("Client {} idle for {:?}, closing", peer_addr, idle_timeout);
                            break;
                        }
                    };

                    Self::update_stats(&stats, |s| {
                        s.request_count += 1;
                        s.bytes_received += (MBAP_HEADER_LEN + pdu.len()) as u64;
                        s.last_client = Some(peer_addr);
                        s.last_request_time = Some(Local::now());
                    });

                    if header.protocol_id != 0 {
                        warn!("Ignoring frame from {} with protocol id {}", peer_addr, header.protocol_id);
                        Self::update_stats(&stats, |s| s.error_count += 1);
                        continue;
                    }

                    debug!(
                        "Processing request: TID={}, Function=0x{:02X}, Unit={}",
                        header.transaction_id, pdu[0], header.unit_id
                    );

                    let (reply_pdu, is_exception) = process_pdu(&banks, header.unit_id, &pdu);
                    let reply = wrap_pdu(
                        Framing::Tcp { transaction_id: header.transaction_id },
                        header.unit_id,
                        &reply_pdu,
                    );

                    if let Err(e) = stream.write_all(&reply).await {
                        error!("Failed to send response to {}: {}", peer_addr, e);
                        break;
                    }

                    Self::update_stats(&stats, |s| {
                        s.response_count += 1;
                        s.bytes_sent += reply.len() as u64;
                        if is_exception {
                            s.error_count += 1;
                        }
                    });
                }
            }
        }

        info!("Client {} disconnected", peer_addr);
    }
}

#[async_trait]
impl ModbusServer for VirtualSlaveServer {
    async fn start(&mut self) -> CellResult<SocketAddr> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(CellError::configuration("Server is already running"));
        }

        let listener = TcpListener::bind(&self.config.bind_address).await.map_err(|e| {
            CellError::connection(format!("Failed to bind to {}: {}", self.config.bind_address, e))
        })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        self.local_addr = Some(local_addr);
        self.start_time = Some(Instant::now());
        self.is_running.store(true, Ordering::SeqCst);

        info!("Virtual slave listening on {}", local_addr);

        let banks = self.banks.clone();
        let stats = self.stats.clone();
        let active = self.active.clone();
        let idle_timeout = self.config.idle_timeout;
        let max_connections = self.config.max_connections;
        let is_running_flag = self.is_running.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                if active.load(Ordering::SeqCst) >= max_connections {
                                    warn!("Rejecting {}: {} connections already open", addr, max_connections);
                                    drop(stream);
                                    continue;
                                }
                                let _ = stream.set_nodelay(true);

                                Self::update_stats(&stats, |s| s.connections_count += 1);
                                active.fetch_add(1, Ordering::SeqCst);

                                let banks = banks.clone();
                                let stats = stats.clone();
                                let active = active.clone();
                                let shutdown_rx = shutdown_tx.subscribe();

                                tokio::spawn(async move {
                                    Self::handle_client(stream, addr, banks, stats, shutdown_rx, idle_timeout).await;
                                    active.fetch_sub(1, Ordering::SeqCst);
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Shutdown signal received, stopping virtual slave");
                        break;
                    }
                }
            }

            is_running_flag.store(false, Ordering::SeqCst);
        });

        Ok(local_addr)
    }

    async fn stop(&mut self) -> CellResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        self.is_running.store(false, Ordering::SeqCst);
        info!("Virtual slave stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn get_stats(&self) -> ServerStats {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone();
        stats.active_connections = self.active.load(Ordering::SeqCst);
        if let Some(start_time) = self.start_time {
            stats.uptime_seconds = start_time.elapsed().as_secs();
        }
        stats
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}
