//! End-to-end relay tests against a scripted in-process engine.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use async_trait::async_trait;
use cell_relay_core::{
    Engine, EngineChannels, EngineError, Envelope, ExecuteReply, ExecuteRequest, ExecutionState,
    Header, Payload, ReplyStatus, RichOutput, StreamName,
};
use cell_relay_proxy::{Relay, RelayError, RelayOptions};
use tokio::sync::mpsc;

/// Engine-side endpoints of the channel pairs handed to the relay.
struct EngineSide {
    requests: mpsc::Receiver<Envelope>,
    replies: mpsc::Sender<Envelope>,
    broadcasts: mpsc::Sender<Envelope>,
    inputs: mpsc::Sender<Envelope>,
    input_replies: mpsc::Receiver<Envelope>,
    interrupts: mpsc::Receiver<()>,
}

struct TestEngine {
    channels: Option<EngineChannels>,
    interrupt_tx: mpsc::Sender<()>,
}

#[async_trait]
impl Engine for TestEngine {
    async fn connect(&mut self) -> Result<EngineChannels, EngineError> {
        self.channels
            .take()
            .ok_or_else(|| EngineError::ConnectFailed("already connected".to_string()))
    }

    async fn interrupt(&mut self) -> Result<(), EngineError> {
        let _ = self.interrupt_tx.send(()).await;
        Ok(())
    }

    async fn shutdown(&mut self, _restart: bool) -> Result<(), EngineError> {
        Ok(())
    }
}

fn engine_pair() -> (TestEngine, EngineSide) {
    let (req_tx, req_rx) = mpsc::channel(64);
    let (rep_tx, rep_rx) = mpsc::channel(64);
    let (bc_tx, bc_rx) = mpsc::channel(256);
    let (in_tx, in_rx) = mpsc::channel(8);
    let (inr_tx, inr_rx) = mpsc::channel(8);
    let (int_tx, int_rx) = mpsc::channel(4);
    (
        TestEngine {
            channels: Some(EngineChannels {
                requests: req_tx,
                replies: rep_rx,
                broadcasts: bc_rx,
                inputs: in_rx,
                input_replies: inr_tx,
            }),
            interrupt_tx: int_tx,
        },
        EngineSide {
            requests: req_rx,
            replies: rep_tx,
            broadcasts: bc_tx,
            inputs: in_tx,
            input_replies: inr_rx,
            interrupts: int_rx,
        },
    )
}

fn stream(parent: &Header, text: impl Into<String>) -> Envelope {
    Envelope::child_of(
        parent,
        Payload::Stream {
            name: StreamName::Stdout,
            text: text.into(),
        },
    )
}

fn status(parent: &Header, execution_state: ExecutionState) -> Envelope {
    Envelope::child_of(parent, Payload::Status { execution_state })
}

fn ok_reply(parent: &Header) -> Envelope {
    Envelope::child_of(
        parent,
        Payload::ExecuteReply(ExecuteReply {
            status: ReplyStatus::Ok,
            execution_count: Some(1),
            extra: serde_json::Map::new(),
        }),
    )
}

/// Scripted engine: behavior keyed by the request code.
///
/// - `count:N` emits N numbered lines in `chunk`-line fragments, then a rich
///   result, idle, and an ok reply.
/// - `echo:<text>` emits the text as one fragment.
/// - `probe` answers with a single stdout fragment.
/// - `ask` raises an input request and echoes the answer.
/// - `hang` emits one fragment and never reaches idle; after an interrupt
///   arrives its terminal signals are delivered 300ms late.
async fn run_engine(mut side: EngineSide, chunk: usize) {
    let mut hung: Option<Header> = None;
    loop {
        tokio::select! {
            req = side.requests.recv() => {
                let Some(req) = req else { break };
                let id = req.header.clone();
                let Payload::ExecuteRequest(request) = req.payload else { continue };
                side.broadcasts.send(status(&id, ExecutionState::Busy)).await.unwrap();

                if let Some(n) = request.code.strip_prefix("count:") {
                    let total: usize = n.trim().parse().unwrap();
                    let mut next = 0;
                    while next < total {
                        let hi = (next + chunk).min(total);
                        let text: String = (next..hi).map(|k| format!("{k}\n")).collect();
                        side.broadcasts.send(stream(&id, text)).await.unwrap();
                        next = hi;
                    }
                    let result = Payload::ExecuteResult(RichOutput {
                        data: serde_json::json!({ "text/plain": format!("{total} lines") }),
                        metadata: serde_json::json!({}),
                        execution_count: Some(1),
                    });
                    side.broadcasts.send(Envelope::child_of(&id, result)).await.unwrap();
                } else if let Some(text) = request.code.strip_prefix("echo:") {
                    side.broadcasts.send(stream(&id, text)).await.unwrap();
                } else if request.code == "probe" {
                    side.broadcasts.send(stream(&id, "engine-answer\n")).await.unwrap();
                } else if request.code == "ask" {
                    let ask = Envelope::child_of(&id, Payload::InputRequest {
                        prompt: "? ".to_string(),
                        password: false,
                    });
                    side.inputs.send(ask).await.unwrap();
                    if let Some(answer) = side.input_replies.recv().await {
                        if let Payload::InputReply { value } = answer.payload {
                            side.broadcasts.send(stream(&id, format!("{value}-ack\n"))).await.unwrap();
                        }
                    }
                } else if request.code == "hang" {
                    side.broadcasts.send(stream(&id, "hanging\n")).await.unwrap();
                    hung = Some(id);
                    continue;
                }

                side.broadcasts.send(status(&id, ExecutionState::Idle)).await.unwrap();
                side.replies.send(ok_reply(&id)).await.unwrap();
            }
            interrupt = side.interrupts.recv() => {
                if interrupt.is_none() {
                    break;
                }
                if let Some(id) = hung.take() {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    let _ = side.broadcasts.send(status(&id, ExecutionState::Idle)).await;
                    let _ = side.replies.send(ok_reply(&id)).await;
                }
            }
        }
    }
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

async fn started_relay(chunk: usize) -> (Relay, tempfile::TempDir) {
    init_tracing();
    let workdir = tempfile::tempdir().unwrap();
    let (engine, side) = engine_pair();
    tokio::spawn(run_engine(side, chunk));
    let options = RelayOptions::new(workdir.path()).grace_period(Duration::from_millis(100));
    let relay = Relay::start(engine, options).await.unwrap();
    (relay, workdir)
}

fn execute_envelope(client_id: &str, code: &str, overrides: HashMap<String, String>) -> Envelope {
    Envelope {
        header: Header {
            msg_id: client_id.to_string(),
        },
        parent: None,
        payload: Payload::ExecuteRequest(ExecuteRequest {
            code: code.to_string(),
            silent: false,
            allow_stdin: true,
            cell_id: None,
            overrides,
        }),
    }
}

fn log_files(workdir: &std::path::Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let log_root = workdir.join(".log");
    let Ok(buckets) = std::fs::read_dir(&log_root) else {
        return found;
    };
    for bucket in buckets.flatten() {
        if !bucket.path().is_dir() {
            continue;
        }
        if let Ok(files) = std::fs::read_dir(bucket.path()) {
            for file in files.flatten() {
                if file.path().extension().is_some_and(|e| e == "log") {
                    found.push(file.path());
                }
            }
        }
    }
    found.sort();
    found
}

fn stream_texts(history: &[Envelope]) -> Vec<String> {
    history
        .iter()
        .filter_map(|env| match &env.payload {
            Payload::Stream { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

fn clear_count(history: &[Envelope]) -> usize {
    history
        .iter()
        .filter(|env| matches!(env.payload, Payload::ClearOutput { .. }))
        .count()
}

#[tokio::test]
async fn test_passthrough_run_reemits_untouched() {
    let (relay, _workdir) = started_relay(10).await;

    let reply = relay
        .execute(
            execute_envelope("client-1", "count:3", HashMap::new()),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    assert_eq!(reply.parent.as_ref().unwrap().msg_id, "client-1");
    assert!(matches!(
        reply.payload,
        Payload::ExecuteReply(ExecuteReply {
            status: ReplyStatus::Ok,
            ..
        })
    ));

    let history = relay.outbound().get_history();
    assert_eq!(clear_count(&history), 0);
    let texts = stream_texts(&history);
    assert_eq!(texts, vec!["0\n1\n2\n".to_string()]);
    for env in &history {
        assert_eq!(env.parent.as_ref().unwrap().msg_id, "client-1");
    }
}

#[tokio::test]
async fn test_forced_summarize_long_run() {
    let (relay, workdir) = started_relay(10).await;

    let reply = relay
        .execute(
            execute_envelope("client-1", "!!count:200", HashMap::new()),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert!(matches!(
        reply.payload,
        Payload::ExecuteReply(ExecuteReply {
            status: ReplyStatus::Ok,
            ..
        })
    ));

    let history = relay.outbound().get_history();

    // 5 raw fragments pass through before the 50-line threshold; the
    // remaining 15 are each replaced behind a clear, plus the final view.
    assert_eq!(clear_count(&history), 16);
    let texts = stream_texts(&history);
    assert_eq!(texts.len(), 21);
    assert_eq!(texts[0], "0\n1\n2\n3\n4\n5\n6\n7\n8\n9\n");

    // First synthetic summary: header block plus the newest line.
    let first_summary = &texts[5];
    assert!(first_summary.contains("start time: "));
    assert!(first_summary.contains("path: "));
    assert!(first_summary.contains("0\n1\n"));
    assert!(first_summary.contains("19\n...\n"));
    assert!(first_summary.ends_with("59"));

    // Final consolidated summary: first 20 lines, ellipsis, last 20 lines.
    let final_summary = texts.last().unwrap();
    assert!(final_summary.contains("end time: "));
    assert!(final_summary.contains("output size: "));
    assert!(final_summary.contains("0\n1\n"));
    assert!(final_summary.contains("180\n"));
    assert!(final_summary.contains("\n199"));

    // The rich result is re-emitted live and replayed after the final view.
    let rich: Vec<&Envelope> = history
        .iter()
        .filter(|env| matches!(env.payload, Payload::ExecuteResult(_)))
        .collect();
    assert_eq!(rich.len(), 2);
    assert!(matches!(
        history.last().unwrap().payload,
        Payload::ExecuteResult(_)
    ));

    // The caller never sees the router-internal correlation id.
    for env in &history {
        assert_eq!(env.parent.as_ref().unwrap().msg_id, "client-1");
    }

    // The physical log holds every line verbatim.
    let logs = log_files(workdir.path());
    assert_eq!(logs.len(), 1);
    let logged = std::fs::read_to_string(&logs[0]).unwrap();
    assert!(logged.contains("count:200\n----\n"));
    for line in 0..200 {
        assert!(logged.contains(&format!("{line}\n")), "line {line} missing");
    }
    assert!(logged.contains("output size: "));
    assert!(logged.contains("result: "));
}

#[tokio::test]
async fn test_boundary_stays_raw_below_start_lines() {
    let (relay, _workdir) = started_relay(1).await;
    let overrides = HashMap::from([("summarize".to_string(), "5:1:1:1".to_string())]);

    relay
        .execute(
            execute_envelope("client-1", "!!count:4", overrides),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    // Four single-line fragments stay raw; only the final view clears.
    let history = relay.outbound().get_history();
    assert_eq!(clear_count(&history), 1);

    let texts = stream_texts(&history);
    assert_eq!(texts.len(), 5);
    assert!(texts[..4].iter().all(|t| !t.contains("...")));
}

#[tokio::test]
async fn test_boundary_engages_past_start_lines() {
    let (relay, _workdir) = started_relay(1).await;
    let overrides = HashMap::from([("summarize".to_string(), "5:1:1:1".to_string())]);

    relay
        .execute(
            execute_envelope("client-1", "!!count:6", overrides),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    // Five fragments reach the threshold raw; the sixth is replaced, then
    // the final view clears once more.
    let history = relay.outbound().get_history();
    assert_eq!(clear_count(&history), 2);
}

#[tokio::test]
async fn test_history_prefix_references_previous_run() {
    let (relay, workdir) = started_relay(3).await;
    let overrides = HashMap::from([
        ("summarize".to_string(), "6:2:1:2".to_string()),
        ("history_id".to_string(), "cell-42".to_string()),
    ]);

    relay
        .execute(
            execute_envelope("client-1", "!!count:10", overrides.clone()),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    let history_file = workdir.path().join(".log/cell-42/cell-42.json");
    let records: Vec<serde_json::Value> =
        serde_json::from_slice(&std::fs::read(&history_file).unwrap()).unwrap();
    assert_eq!(records.len(), 1);
    let first_log_path = records[0]["log_path"].as_str().unwrap().to_string();
    let first_start = records[0]["start"].as_str().unwrap().to_string();

    relay
        .execute(
            execute_envelope("client-2", "!!count:10", overrides),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    let texts = stream_texts(&relay.outbound().get_history());
    let final_summary = texts.last().unwrap();
    assert!(final_summary.contains(&first_log_path));
    assert!(final_summary.contains(&first_start));

    let records: Vec<serde_json::Value> =
        serde_json::from_slice(&std::fs::read(&history_file).unwrap()).unwrap();
    assert_eq!(records.len(), 2);

    // The cell directory links back to the physical log file.
    let linked = workdir
        .path()
        .join(".log/cell-42")
        .join(std::path::Path::new(&first_log_path).file_name().unwrap());
    assert!(std::fs::read_to_string(&linked).is_ok());
}

#[tokio::test]
async fn test_masking_applies_to_relayed_output() {
    let (relay, _workdir) = started_relay(10).await;
    let overrides = HashMap::from([("masking_pattern".to_string(), "[0-9]+".to_string())]);

    relay
        .execute(
            execute_envelope("client-1", "echo:abc\n1234567890\nxyz\n", overrides),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    let texts = stream_texts(&relay.outbound().get_history());
    assert_eq!(texts, vec!["abc\n**********\nxyz\n".to_string()]);
}

#[tokio::test]
async fn test_interrupt_grace_finalizes_with_partial_output() {
    let (relay, workdir) = started_relay(10).await;

    let exec = {
        let relay = relay.clone();
        tokio::spawn(async move {
            relay
                .execute(execute_envelope("client-1", "!!hang", HashMap::new()), None)
                .await
        })
    };

    // Let the request reach the engine and produce its first fragment.
    tokio::time::sleep(Duration::from_millis(50)).await;
    relay.interrupt().await.unwrap();

    let reply = exec.await.unwrap().unwrap();
    assert!(matches!(
        reply.payload,
        Payload::ExecuteReply(ExecuteReply {
            status: ReplyStatus::Aborted,
            ..
        })
    ));

    // Buffered output was flushed and the record closed out.
    let logs = log_files(workdir.path());
    assert_eq!(logs.len(), 1);
    let logged = std::fs::read_to_string(&logs[0]).unwrap();
    assert!(logged.contains("hanging\n"));
    assert!(logged.contains("output size: "));

    // The engine delivers its terminal signals late; they are dropped as
    // unknown and the relay keeps serving requests.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let reply = relay
        .execute(
            execute_envelope("client-2", "count:1", HashMap::new()),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert!(matches!(
        reply.payload,
        Payload::ExecuteReply(ExecuteReply {
            status: ReplyStatus::Ok,
            ..
        })
    ));
}

#[tokio::test]
async fn test_caller_timeout_abandons_request() {
    let (relay, _workdir) = started_relay(10).await;

    let err = relay
        .execute(
            execute_envelope("client-1", "hang", HashMap::new()),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Timeout));

    // The engine is still busy with the abandoned request; single-flight
    // holds until it reaches a terminal state.
    let err = relay
        .execute(
            execute_envelope("client-2", "count:1", HashMap::new()),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Busy));
}

#[tokio::test]
async fn test_query_is_not_forwarded_to_client() {
    let (relay, _workdir) = started_relay(10).await;

    let answer = relay.query("probe", Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(answer, "engine-answer\n");
    assert!(relay.outbound().get_history().is_empty());
}

#[tokio::test]
async fn test_stray_broadcast_is_dropped() {
    let workdir = tempfile::tempdir().unwrap();
    let (engine, mut side) = engine_pair();
    tokio::spawn(async move {
        let stray = stream(&Header::fresh(), "leftover\n");
        side.broadcasts.send(stray).await.unwrap();
        run_engine(side, 10).await;
    });
    let relay = Relay::start(engine, RelayOptions::new(workdir.path()))
        .await
        .unwrap();

    let reply = relay
        .execute(
            execute_envelope("client-1", "count:2", HashMap::new()),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert!(matches!(reply.payload, Payload::ExecuteReply(_)));

    let texts = stream_texts(&relay.outbound().get_history());
    assert_eq!(texts, vec!["0\n1\n".to_string()]);
}

#[tokio::test]
async fn test_interactive_input_roundtrip() {
    let (relay, _workdir) = started_relay(10).await;
    let mut rx = relay.outbound().get_receiver();

    let exec = {
        let relay = relay.clone();
        tokio::spawn(async move {
            relay
                .execute(
                    execute_envelope("client-1", "ask", HashMap::new()),
                    Some(Duration::from_secs(5)),
                )
                .await
        })
    };

    loop {
        let env = rx.recv().await.unwrap();
        if let Payload::InputRequest { prompt, .. } = &env.payload {
            assert_eq!(prompt, "? ");
            assert_eq!(env.parent.as_ref().unwrap().msg_id, "client-1");
            break;
        }
    }
    relay.input_reply("secret").await.unwrap();

    let reply = exec.await.unwrap().unwrap();
    assert!(matches!(
        reply.payload,
        Payload::ExecuteReply(ExecuteReply {
            status: ReplyStatus::Ok,
            ..
        })
    ));
    let texts = stream_texts(&relay.outbound().get_history());
    assert!(texts.iter().any(|t| t == "secret-ack\n"));
}

#[tokio::test]
async fn test_static_dispatch_table() {
    let (relay, _workdir) = started_relay(10).await;

    let reply = relay
        .handle(Envelope::new(Payload::InterruptRequest), None)
        .await
        .unwrap();
    assert!(matches!(reply.unwrap().payload, Payload::InterruptReply));

    let err = relay
        .handle(
            Envelope::new(Payload::Status {
                execution_state: ExecutionState::Idle,
            }),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Unsupported("status")));
}

#[tokio::test]
async fn test_shutdown_stops_router() {
    let (relay, _workdir) = started_relay(10).await;
    relay.shutdown(false).await.unwrap();

    let err = relay
        .execute(execute_envelope("client-1", "count:1", HashMap::new()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::RouterStopped));
}
