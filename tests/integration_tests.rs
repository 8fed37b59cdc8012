//! Integration Tests for the Stepper Cell
//!
//! These tests wire the simulator, field controller, virtual slave and
//! supervisory bridge together over real loopback sockets and an in-memory
//! serial line.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use stepper_cell::config::controller_map as map;
use stepper_cell::device::{counter_map, drive_map};
use stepper_cell::protocol::{self, MBAP_HEADER_LEN};
use stepper_cell::utils::logging::init_test_logger;
use stepper_cell::*;

/// Serial timing short enough for tests, still inside the silence band
fn fast_timing() -> FrameTiming {
    FrameTiming {
        response_timeout_ms: 200,
        settle_delay_ms: 1,
        silence_window_ms: 20,
    }
}

/// Controller talking to a simulator over an in-memory serial line, with its
/// register interface on a loopback port
async fn controller_cell(simulator: Arc<FieldSimulator>) -> (Arc<FieldController>, VirtualSlaveServer) {
    init_test_logger();
    let transport = SerialTransport::new(SerialConfig {
        port: "sim".to_string(),
        timing: fast_timing(),
        ..SerialConfig::default()
    });
    let (near, far) = duplex(512);
    transport.attach(near).await;
    tokio::spawn(simulator.serve_rtu(far));

    let config = ControllerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        ..ControllerConfig::default()
    };
    let controller = Arc::new(FieldController::new(config, Arc::new(transport), EventSink::default()));
    let server = controller.serve_interface().await.unwrap();
    (controller, server)
}

/// Bridge polling `server`, with its operator listener on a loopback port and
/// one operator connected
async fn bridge_with_operator(
    server: &VirtualSlaveServer,
) -> (Arc<SupervisoryBridge>, OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf) {
    let config = BridgeConfig {
        controller: TcpClientConfig {
            address: server.local_addr().unwrap().to_string(),
            ..TcpClientConfig::default()
        },
        operator_bind_address: "127.0.0.1:0".to_string(),
        ..BridgeConfig::default()
    };
    let bridge = Arc::new(SupervisoryBridge::new(config, EventSink::default()));
    let addr = bridge.serve_operators().await.unwrap();

    let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
    wait_until(|| async { bridge.operator_connected().await }).await;
    (bridge, reader, writer)
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

async fn next_status(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Value {
    loop {
        let line = timeout(Duration::from_secs(2), lines.next_line())
            .await
            .expect("no status pushed")
            .unwrap()
            .expect("operator link closed");
        let message: Value = serde_json::from_str(&line).unwrap();
        if message["type"] == "status" {
            return message;
        }
    }
}

async fn exchange(stream: &mut TcpStream, frame: &[u8]) -> Vec<u8> {
    stream.write_all(frame).await.unwrap();
    let mut reply = vec![0u8; MBAP_HEADER_LEN];
    stream.read_exact(&mut reply).await.unwrap();
    let header = protocol::MbapHeader::parse(&reply).unwrap();
    let mut pdu = vec![0u8; header.pdu_len()];
    stream.read_exact(&mut pdu).await.unwrap();
    reply.extend_from_slice(&pdu);
    reply
}

/// Two clients addressing different units never see each other's data or ids
#[tokio::test]
async fn test_concurrent_clients_on_different_units() {
    init_test_logger();
    let mut server = VirtualSlaveServer::new(
        VirtualSlaveConfig {
            bind_address: "127.0.0.1:0".to_string(),
            ..VirtualSlaveConfig::default()
        },
        Arc::new(NodeBanks::default()),
    );
    let addr = server.start().await.unwrap();

    let client = |unit: u8, first_tid: u16| async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        for i in 0..25u16 {
            let tid = first_tid + i;
            let framing = Framing::Tcp { transaction_id: tid };

            let write = ModbusRequest::write_multiple(unit, 100, &[tid; 4]);
            let reply = exchange(&mut stream, &write.encode(framing)).await;
            protocol::parse_response(&reply, framing, &write).unwrap();

            let read = ModbusRequest::read_holding(unit, 100, 4);
            let reply = exchange(&mut stream, &read.encode(framing)).await;
            let response = protocol::parse_response(&reply, framing, &read).unwrap();
            assert_eq!(response.registers(), &[tid; 4]);
        }
    };

    tokio::join!(client(1, 1000), client(2, 2000));

    let banks = server.banks();
    assert_eq!(banks.bank(1).read_holding_registers(100, 4), vec![1024; 4]);
    assert_eq!(banks.bank(2).read_holding_registers(100, 4), vec![2024; 4]);

    let stats = server.get_stats();
    assert_eq!(stats.request_count, 100);
    assert_eq!(stats.error_count, 0);
    server.stop().await.unwrap();
}

/// An operator `set_target` reaches the counter and comes back in the next push
#[tokio::test]
async fn test_set_target_flows_from_operator_to_counter() {
    let simulator = Arc::new(FieldSimulator::new(NodeIds::default()));
    let (controller, server) = controller_cell(simulator.clone()).await;
    let (bridge, reader, mut writer) = bridge_with_operator(&server).await;
    let mut lines = BufReader::new(reader).lines();

    let before = server.get_stats().request_count;
    writer
        .write_all(b"{\"type\":\"set_target\",\"source\":\"remote\",\"priority\":3,\"data\":{\"target\":50}}\n")
        .await
        .unwrap();
    let bank = controller.bank();
    wait_until(|| async { bank.read_holding_register(map::HR_TARGET) == 50 }).await;
    assert_eq!(server.get_stats().request_count, before + 1);

    controller.tick().await;
    assert_eq!(simulator.written(3, counter_map::TARGET), vec![vec![50]]);

    controller.poll_devices().await;
    bridge.poll_controller().await.unwrap();
    let status = next_status(&mut lines).await;
    assert_eq!(status["data"]["counter_target"], 50);
    assert_eq!(status["data"]["auto_state_text"], "Waiting count");
    assert_eq!(status["data"]["commands_from_operator"], 1);
}

/// A stop relayed in manual mode is executed once and the slot cleared
#[tokio::test]
async fn test_operator_stop_is_consumed_once() {
    let simulator = Arc::new(FieldSimulator::new(NodeIds::default()));
    let (controller, server) = controller_cell(simulator.clone()).await;
    let (_bridge, _reader, mut writer) = bridge_with_operator(&server).await;

    writer
        .write_all(b"{\"type\":\"set_mode\",\"data\":{\"mode\":1}}\n{\"type\":\"heartbeat\"}\n{\"type\":\"stop_motor\"}\n")
        .await
        .unwrap();
    let bank = controller.bank();
    wait_until(|| async { bank.read_holding_register(map::HR_COMMAND) == CommandCode::Stop.to_u16() }).await;
    assert_eq!(bank.read_holding_register(map::HR_MODE), map::MODE_MANUAL);

    assert_eq!(controller.tick().await, AutoState::Manual);
    assert_eq!(simulator.written(2, drive_map::STOP), vec![vec![1]]);
    assert_eq!(bank.read_holding_register(map::HR_COMMAND), 0);

    controller.tick().await;
    assert_eq!(simulator.written(2, drive_map::STOP).len(), 1);
    assert_eq!(bank.read_input_register(map::IR_AUTO_STATE), AutoState::Manual.code());
}

/// Counting up to the target runs one move, resets the counter and rearms
#[tokio::test]
async fn test_full_automatic_cycle() {
    let simulator = Arc::new(FieldSimulator::new(NodeIds::default()).with_counting(true));
    let (controller, _server) = controller_cell(simulator.clone()).await;
    controller.set_target(3).await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..20 {
        simulator.step();
        controller.poll_devices().await;
        let state = controller.tick().await;
        if seen.last() != Some(&state) {
            seen.push(state);
        }
        if state == AutoState::WaitingReset {
            // let the counter reset land and rearm
            for _ in 0..3 {
                simulator.step();
                controller.poll_devices().await;
                let state = controller.tick().await;
                if seen.last() != Some(&state) {
                    seen.push(state);
                }
            }
            break;
        }
    }

    assert_eq!(
        seen,
        vec![
            AutoState::WaitingCount,
            AutoState::MotorRunning,
            AutoState::WaitingReset,
            AutoState::Idle,
            AutoState::WaitingCount,
        ]
    );
    assert_eq!(simulator.written(2, drive_map::MOVE_INCREMENTAL).len(), 1);
    assert_eq!(simulator.written(3, counter_map::RESET).len(), 1);
    assert_eq!(simulator.drive_position(), 5000);
}

/// Manual mode holds the cycle even with the counter at target and an alarm
#[tokio::test]
async fn test_manual_mode_blocks_automatic_transitions() {
    let simulator = Arc::new(FieldSimulator::new(NodeIds::default()));
    let (controller, _server) = controller_cell(simulator.clone()).await;
    controller.set_target(5).await.unwrap();
    controller.tick().await;
    simulator.set_counter(5);
    simulator.set_drive_alarm(true);
    controller.set_mode(map::MODE_MANUAL).await.unwrap();

    for _ in 0..5 {
        controller.poll_devices().await;
        assert_eq!(controller.tick().await, AutoState::Manual);
    }
    assert!(simulator.written(2, drive_map::MOVE_INCREMENTAL).is_empty());
    assert!(simulator.written(3, counter_map::RESET).is_empty());
}

/// The controller runs unchanged against the virtual slave over TCP
#[tokio::test]
async fn test_controller_against_virtual_slave_over_tcp() {
    init_test_logger();
    let simulator = Arc::new(FieldSimulator::new(NodeIds::default()));
    simulator.set_sensor(21.5, 48.0);
    let mut slave = VirtualSlaveServer::new(
        VirtualSlaveConfig {
            bind_address: "127.0.0.1:0".to_string(),
            ..VirtualSlaveConfig::default()
        },
        simulator.banks(),
    );
    let addr = slave.start().await.unwrap();

    let transport = Arc::new(TcpTransport::new(TcpClientConfig {
        address: addr.to_string(),
        ..TcpClientConfig::default()
    }));
    assert!(transport.open().await);
    let controller = FieldController::new(ControllerConfig::default(), transport.clone(), EventSink::default());

    controller.poll_devices().await;
    let snapshot = controller.snapshot().await;
    assert!(snapshot.sensor_ok);
    assert_eq!(snapshot.temperature, 21.5);
    assert_eq!(snapshot.humidity, 48.0);
    assert!(snapshot.drive.in_position);
    assert!(snapshot.devices.iter().all(|d| d.connected && d.counters.errors == 0));
    assert_eq!(transport.get_stats().timeout_count, 0);

    slave.stop().await.unwrap();
}
