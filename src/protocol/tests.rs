// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::core::frame;
use crate::error::{FrameError, ProtocolError};
use crate::protocol::client::{ClientHooks, ClientRuntime, FrameContext, HandlerTable};
use crate::protocol::server::{DispatchTable, InboundDispatch, SendFn, ServerHooks, ServerRuntime};
use crate::protocol::{DispatchOutcome, OpcodeNames, StaticOpcodeNames};
use crate::transport::TransportSink;
use crate::utils::metrics::Metrics;

const PING: u16 = 0x0001;
const ECHO: u16 = 0x0002;
const FAIL: u16 = 0x0003;
const PANIC: u16 = 0x0004;

static NAMES: &[(u16, &str)] = &[(PING, "Ping"), (ECHO, "Echo"), (FAIL, "Fail")];

#[derive(Default)]
struct Reports {
    unhandled: Vec<(u16, Option<String>)>,
    parse_errors: Vec<FrameError>,
    handler_errors: Vec<(u16, String)>,
    errors: Vec<String>,
    closes: Vec<u16>,
    overflows: Vec<u64>,
}

struct RecordingHooks(Arc<Mutex<Reports>>);

impl ClientHooks for RecordingHooks {
    fn on_close(&mut self, code: u16, _reason: &str) {
        self.0.lock().unwrap().closes.push(code);
    }

    fn on_error(&mut self, message: &str) {
        self.0.lock().unwrap().errors.push(message.to_string());
    }

    fn on_unhandled_frame(&mut self, ctx: &FrameContext, name: Option<&str>, _payload: &[u8]) {
        self.0
            .lock()
            .unwrap()
            .unhandled
            .push((ctx.opcode, name.map(str::to_string)));
    }

    fn on_parse_error(&mut self, _session_id: u64, error: &FrameError) {
        self.0.lock().unwrap().parse_errors.push(*error);
    }

    fn on_handler_error(&mut self, ctx: &FrameContext, error: &ProtocolError) {
        self.0
            .lock()
            .unwrap()
            .handler_errors
            .push((ctx.opcode, error.to_string()));
    }

    fn on_overflow(&mut self, dropped: u64) {
        self.0.lock().unwrap().overflows.push(dropped);
    }
}

type Pings = Arc<Mutex<Vec<Vec<u8>>>>;

fn client_runtime() -> (ClientRuntime, Arc<Mutex<Reports>>, Pings, Arc<Metrics>) {
    let reports = Arc::new(Mutex::new(Reports::default()));
    let pings = Arc::new(Mutex::new(Vec::new()));
    let metrics = Arc::new(Metrics::new());

    let mut table = HandlerTable::new().with_names(StaticOpcodeNames(NAMES));
    let seen = pings.clone();
    table
        .register(PING, move |_, payload| {
            seen.lock().unwrap().push(payload.to_vec());
            Ok(())
        })
        .unwrap();
    table
        .register(FAIL, |_, _| Err(ProtocolError::Handler("rejected".into())))
        .unwrap();
    table
        .register(PANIC, |_, _| panic!("handler blew up"))
        .unwrap();

    let runtime = ClientRuntime::new(
        table,
        Box::new(RecordingHooks(reports.clone())),
        metrics.clone(),
    );
    (runtime, reports, pings, metrics)
}

#[test]
fn test_client_routes_known_opcode() {
    let (mut runtime, _, pings, _) = client_runtime();
    let outcome = runtime.dispatch(1, &frame::encode(PING, b"hello"));
    assert_eq!(outcome, DispatchOutcome::Handled);
    assert_eq!(*pings.lock().unwrap(), vec![b"hello".to_vec()]);
}

#[test]
fn test_client_unknown_opcode_reaches_hook_not_error() {
    let (mut runtime, reports, _, metrics) = client_runtime();
    assert_eq!(
        runtime.dispatch(1, &frame::encode(ECHO, b"")),
        DispatchOutcome::Unknown(ECHO)
    );
    assert_eq!(
        runtime.dispatch(1, &frame::encode(0x7777, b"")),
        DispatchOutcome::Unknown(0x7777)
    );

    let reports = reports.lock().unwrap();
    assert_eq!(
        reports.unhandled,
        vec![(ECHO, Some("Echo".to_string())), (0x7777, None)]
    );
    assert!(reports.errors.is_empty());
    assert!(reports.closes.is_empty());
    assert_eq!(metrics.snapshot().unknown_opcodes, 2);
}

#[test]
fn test_client_short_message_is_parse_error() {
    let (mut runtime, reports, _, metrics) = client_runtime();
    assert_eq!(runtime.dispatch(1, &[0x01]), DispatchOutcome::Malformed);
    assert_eq!(
        reports.lock().unwrap().parse_errors,
        vec![FrameError::TooShort { len: 1 }]
    );
    assert_eq!(metrics.snapshot().parse_errors, 1);
}

#[test]
fn test_client_handler_error_and_panic_are_isolated() {
    let (mut runtime, reports, pings, metrics) = client_runtime();
    assert_eq!(
        runtime.dispatch(1, &frame::encode(FAIL, b"")),
        DispatchOutcome::Failed(FAIL)
    );
    assert_eq!(
        runtime.dispatch(1, &frame::encode(PANIC, b"")),
        DispatchOutcome::Failed(PANIC)
    );

    // Later frames still dispatch
    assert_eq!(
        runtime.dispatch(1, &frame::encode(PING, b"after")),
        DispatchOutcome::Handled
    );
    assert_eq!(pings.lock().unwrap().len(), 1);

    let reports = reports.lock().unwrap();
    assert_eq!(reports.handler_errors.len(), 2);
    assert!(reports.handler_errors[1].1.contains("handler blew up"));
    assert_eq!(metrics.snapshot().handler_failures, 2);
}

#[test]
fn test_client_lifecycle_events_reach_hooks() {
    let (mut runtime, reports, _, _) = client_runtime();
    runtime.on_connect_failed("refused");
    runtime.on_error("reset");
    runtime.on_close(1006, "reset");
    runtime.on_overflow(4);

    let reports = reports.lock().unwrap();
    assert_eq!(reports.errors, vec!["reset"]);
    assert_eq!(reports.closes, vec![1006]);
    assert_eq!(reports.overflows, vec![4]);
}

#[test]
fn test_duplicate_registration_rejected() {
    let mut table = HandlerTable::new().with_names(StaticOpcodeNames(NAMES));
    table.register(PING, |_, _| Ok(())).unwrap();
    let err = table.register(PING, |_, _| Ok(())).unwrap_err();
    assert!(matches!(err, ProtocolError::ConfigError(ref m) if m.contains("Ping")));

    let mut dispatch = DispatchTable::new();
    dispatch.register(PING, |_, _| Ok(())).unwrap();
    assert!(dispatch.register(PING, |_, _| Ok(())).is_err());
}

#[test]
fn test_static_names_lookup() {
    let names = StaticOpcodeNames(NAMES);
    assert_eq!(names.name(FAIL), Some("Fail"));
    assert_eq!(names.name(0xFFFF), None);
}

#[derive(Default)]
struct ServerReports {
    unknown: Mutex<Vec<u16>>,
    parse_errors: Mutex<usize>,
    handler_errors: Mutex<Vec<u16>>,
}

impl ServerHooks for ServerReports {
    fn on_unknown_inbound_opcode(&self, _session_id: u64, opcode: u16, _payload: &[u8]) {
        self.unknown.lock().unwrap().push(opcode);
    }

    fn on_parse_error(&self, _session_id: u64, _error: &FrameError) {
        *self.parse_errors.lock().unwrap() += 1;
    }

    fn on_handler_error(&self, _session_id: u64, opcode: u16, _error: &ProtocolError) {
        self.handler_errors.lock().unwrap().push(opcode);
    }
}

type Outbox = Arc<Mutex<Vec<(u64, Bytes)>>>;

fn server_runtime() -> (ServerRuntime, Arc<ServerReports>, Outbox) {
    let outbox: Outbox = Arc::new(Mutex::new(Vec::new()));
    let sink = outbox.clone();
    let send: SendFn = Arc::new(move |session_id, frame| {
        sink.lock().unwrap().push((session_id, frame));
        Ok(())
    });

    let mut table = DispatchTable::new().with_names(StaticOpcodeNames(NAMES));
    table
        .register(ECHO, |ctx, payload| ctx.reply(ECHO, payload))
        .unwrap();
    table
        .register(FAIL, |_, _| Err(ProtocolError::Handler("nope".into())))
        .unwrap();
    table
        .register(PANIC, |_, _| panic!("inbound panic"))
        .unwrap();

    let reports = Arc::new(ServerReports::default());
    let runtime = ServerRuntime::new(Arc::new(table), send).with_hooks(reports.clone());
    (runtime, reports, outbox)
}

#[test]
fn test_server_echo_through_outbound_proxy() {
    let (runtime, _, outbox) = server_runtime();
    assert_eq!(
        runtime.on_binary_message(9, &frame::encode(ECHO, b"hi")),
        DispatchOutcome::Handled
    );

    let outbox = outbox.lock().unwrap();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].0, 9);
    let reply = frame::decode(&outbox[0].1).unwrap();
    assert_eq!(reply.opcode, ECHO);
    assert_eq!(&reply.payload[..], b"hi");
}

#[test]
fn test_server_unknown_opcode_is_reported_only() {
    let (runtime, reports, outbox) = server_runtime();
    for _ in 0..1000 {
        assert_eq!(
            runtime.on_binary_message(1, &frame::encode(0x4242, b"x")),
            DispatchOutcome::Unknown(0x4242)
        );
    }
    assert_eq!(reports.unknown.lock().unwrap().len(), 1000);
    assert!(outbox.lock().unwrap().is_empty());
    assert_eq!(runtime.metrics().snapshot().unknown_opcodes, 1000);
}

#[test]
fn test_server_failures_are_caught_at_boundary() {
    let (runtime, reports, _) = server_runtime();
    assert_eq!(runtime.on_binary_message(1, &[]), DispatchOutcome::Malformed);
    assert_eq!(
        runtime.on_binary_message(1, &frame::encode(FAIL, b"")),
        DispatchOutcome::Failed(FAIL)
    );
    assert_eq!(
        runtime.on_binary_message(1, &frame::encode(PANIC, b"")),
        DispatchOutcome::Failed(PANIC)
    );
    assert_eq!(*reports.parse_errors.lock().unwrap(), 1);
    assert_eq!(*reports.handler_errors.lock().unwrap(), vec![FAIL, PANIC]);
}

#[test]
fn test_outbound_proxy_is_built_once() {
    let (runtime, _, _) = server_runtime();
    let first = runtime.outbound() as *const _;
    let second = runtime.outbound() as *const _;
    assert_eq!(first, second);
}

#[test]
fn test_broadcast_counts_accepting_sessions() {
    let send: SendFn = Arc::new(|session_id, _| {
        if session_id == 2 {
            Err(ProtocolError::UnknownSession(session_id))
        } else {
            Ok(())
        }
    });
    let runtime = ServerRuntime::new(Arc::new(DispatchTable::new()), send);
    assert_eq!(runtime.outbound().broadcast([1, 2, 3], PING, b"all"), 2);
    assert_eq!(runtime.metrics().snapshot().messages_sent, 2);
}

#[test]
fn test_dispatch_table_is_known() {
    let mut table = DispatchTable::new();
    table.register(ECHO, |_, _| Ok(())).unwrap();
    assert!(table.is_known(ECHO));
    assert!(!table.is_known(PING));
}

#[test]
#[tracing_test::traced_test]
fn test_default_server_hooks_log_failures() {
    let mut table = DispatchTable::new();
    table
        .register(FAIL, |_, _| Err(ProtocolError::Handler("nope".into())))
        .unwrap();
    let send: SendFn = Arc::new(|_, _| Ok(()));
    let runtime = ServerRuntime::new(Arc::new(table), send);

    runtime.on_binary_message(5, &frame::encode(FAIL, b""));
    runtime.on_binary_message(5, &[0x01]);

    assert!(logs_contain("Inbound handler failed"));
    assert!(logs_contain("Dropping malformed frame"));
}
