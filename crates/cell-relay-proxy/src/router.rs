//! Message router: correlation, transformation, and finalization.
//!
//! One coordinator task owns the correlation map and all per-request
//! pipeline state. Channel readers and the dispatch path talk to it through
//! a single event queue; completion is signalled back over per-request
//! oneshot channels. The caller-facing [`Relay`] handle is cheap to clone
//! around and never touches shared state directly.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use cell_relay_core::{
    Engine, EngineError, Envelope, ExecuteReply, ExecuteRequest, ExecutionRecord, ExecutionState,
    Header, OutboundStore, Payload, RecordStatus, ReplyStatus, StreamName,
};
use cell_relay_filter::{
    ensure_default_pattern_file, mask, strip_force_marker, ConfigSnapshot, ForwardTarget,
};
use cell_relay_store::{HistoryStore, LogForwarder, OutputLog, ResultCache, StoreError};
use regex::Regex;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::summarize::{FragmentAction, StreamSummarizer};

/// Log tree directory under the working directory.
const LOG_DIR_NAME: &str = ".log";

/// Router error.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Timed out waiting for reply")]
    Timeout,
    #[error("Another request is already in flight")]
    Busy,
    #[error("Engine disconnected")]
    EngineDisconnected,
    #[error("Router stopped")]
    RouterStopped,
    #[error("Unsupported request kind: {0}")]
    Unsupported(&'static str),
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Persistence error: {0}")]
    Store(#[from] StoreError),
}

/// Router construction options.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Directory holding the config file, keyword patterns, and the log tree.
    pub workdir: PathBuf,
    /// Grace period between a forwarded interrupt and forced log finalization.
    pub grace_period: Duration,
}

impl RelayOptions {
    /// Options rooted at the given working directory.
    #[must_use]
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            grace_period: Duration::from_secs(5),
        }
    }

    /// Override the interrupt grace period.
    #[must_use]
    pub const fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }
}

/// Events consumed by the coordinator task.
pub(crate) enum Event {
    Dispatch {
        envelope: Envelope,
        done: oneshot::Sender<Result<Envelope, RelayError>>,
    },
    Query {
        code: String,
        done: oneshot::Sender<Result<String, RelayError>>,
    },
    Interrupt {
        done: oneshot::Sender<Result<(), RelayError>>,
    },
    ClientInput {
        value: String,
    },
    Shutdown {
        restart: bool,
        done: oneshot::Sender<Result<(), RelayError>>,
    },
    Reply(Envelope),
    Broadcast(Envelope),
    InputRequest(Envelope),
    GraceExpired {
        msg_id: String,
    },
    ChannelClosed {
        channel: &'static str,
    },
}

/// Proxy between an interactive client and a wrapped execution engine.
///
/// Forwards control-plane requests, transforms and persists the output
/// streamed back on independent channels, and replays cached rich results
/// at the end of a truncated view. Cheap to clone; all clones talk to the
/// same coordinator.
#[derive(Clone)]
pub struct Relay {
    events: mpsc::Sender<Event>,
    outbound: Arc<OutboundStore>,
}

impl Relay {
    /// Connect to the engine and start the reader and coordinator tasks.
    ///
    /// # Errors
    /// Returns error if the engine connection or the working directory
    /// cannot be established.
    pub async fn start<E>(mut engine: E, options: RelayOptions) -> Result<Self, RelayError>
    where
        E: Engine + Sync + 'static,
    {
        let channels = engine.connect().await?;

        tokio::fs::create_dir_all(&options.workdir)
            .await
            .map_err(StoreError::from)?;
        if let Err(e) = ensure_default_pattern_file(&options.workdir) {
            tracing::warn!("could not write default keyword patterns: {e}");
        }

        let outbound = Arc::new(OutboundStore::new());
        let (events_tx, events_rx) = mpsc::channel(256);

        crate::reader::spawn_readers(
            channels.replies,
            channels.broadcasts,
            channels.inputs,
            &events_tx,
        );

        let coordinator = Coordinator {
            engine,
            requests: channels.requests,
            input_replies: channels.input_replies,
            outbound: Arc::clone(&outbound),
            events: events_tx.clone(),
            workdir: options.workdir.clone(),
            log_root: options.workdir.join(LOG_DIR_NAME),
            grace_period: options.grace_period,
            entries: HashMap::new(),
            current: None,
            quiet_queries: 0,
        };
        tokio::spawn(coordinator.run(events_rx));

        Ok(Self {
            events: events_tx,
            outbound,
        })
    }

    /// Delivery buffer carrying the transformed client-bound messages.
    #[must_use]
    pub fn outbound(&self) -> Arc<OutboundStore> {
        Arc::clone(&self.outbound)
    }

    /// Dispatch one inbound request by kind.
    ///
    /// The supported kinds are fixed: execute, interrupt, input reply, and
    /// shutdown. Returns the reply envelope where the kind produces one.
    ///
    /// # Errors
    /// Returns error for unsupported kinds or a failed dispatch.
    pub async fn handle(
        &self,
        envelope: Envelope,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>, RelayError> {
        match &envelope.payload {
            Payload::ExecuteRequest(_) => self.execute(envelope, timeout).await.map(Some),
            Payload::InterruptRequest => {
                let origin = envelope.header.clone();
                self.interrupt().await?;
                Ok(Some(Envelope::child_of(&origin, Payload::InterruptReply)))
            }
            Payload::InputReply { value } => {
                self.input_reply(value.clone()).await?;
                Ok(None)
            }
            Payload::ShutdownRequest { restart } => {
                let (origin, restart) = (envelope.header.clone(), *restart);
                self.shutdown(restart).await?;
                Ok(Some(Envelope::child_of(
                    &origin,
                    Payload::ShutdownReply { restart },
                )))
            }
            other => Err(RelayError::Unsupported(kind_name(other))),
        }
    }

    /// Forward an execute request and wait for its transformed reply.
    ///
    /// # Errors
    /// Returns `Timeout` when the caller deadline elapses, `Busy` when a
    /// request is already in flight.
    pub async fn execute(
        &self,
        envelope: Envelope,
        timeout: Option<Duration>,
    ) -> Result<Envelope, RelayError> {
        if !matches!(envelope.payload, Payload::ExecuteRequest(_)) {
            return Err(RelayError::Unsupported(kind_name(&envelope.payload)));
        }
        let (done, done_rx) = oneshot::channel();
        self.events
            .send(Event::Dispatch { envelope, done })
            .await
            .map_err(|_| RelayError::RouterStopped)?;
        await_done(done_rx, timeout).await
    }

    /// Forward an interrupt to the engine and arm the grace timer.
    ///
    /// # Errors
    /// Returns error if the engine rejects the interrupt.
    pub async fn interrupt(&self) -> Result<(), RelayError> {
        let (done, done_rx) = oneshot::channel();
        self.events
            .send(Event::Interrupt { done })
            .await
            .map_err(|_| RelayError::RouterStopped)?;
        await_done(done_rx, None).await
    }

    /// Run a router-internal query against the engine.
    ///
    /// The engine's answer is captured and returned; nothing reaches the
    /// client while the query is in flight.
    ///
    /// # Errors
    /// Returns `Timeout` when the deadline elapses.
    pub async fn query(
        &self,
        code: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<String, RelayError> {
        let (done, done_rx) = oneshot::channel();
        self.events
            .send(Event::Query {
                code: code.into(),
                done,
            })
            .await
            .map_err(|_| RelayError::RouterStopped)?;
        await_done(done_rx, timeout).await
    }

    /// Relay an interactive-input answer to the engine.
    ///
    /// # Errors
    /// Returns error if the router has stopped.
    pub async fn input_reply(&self, value: impl Into<String>) -> Result<(), RelayError> {
        self.events
            .send(Event::ClientInput {
                value: value.into(),
            })
            .await
            .map_err(|_| RelayError::RouterStopped)
    }

    /// Finalize any in-flight request and shut the engine down.
    ///
    /// # Errors
    /// Returns error if the engine shutdown fails.
    pub async fn shutdown(&self, restart: bool) -> Result<(), RelayError> {
        let (done, done_rx) = oneshot::channel();
        self.events
            .send(Event::Shutdown { restart, done })
            .await
            .map_err(|_| RelayError::RouterStopped)?;
        await_done(done_rx, None).await
    }
}

async fn await_done<T>(
    done_rx: oneshot::Receiver<Result<T, RelayError>>,
    deadline: Option<Duration>,
) -> Result<T, RelayError> {
    match deadline {
        Some(deadline) => match tokio::time::timeout(deadline, done_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RelayError::RouterStopped),
            Err(_) => Err(RelayError::Timeout),
        },
        None => done_rx.await.unwrap_or(Err(RelayError::RouterStopped)),
    }
}

const fn kind_name(payload: &Payload) -> &'static str {
    match payload {
        Payload::ExecuteRequest(_) => "execute_request",
        Payload::ExecuteReply(_) => "execute_reply",
        Payload::InterruptRequest => "interrupt_request",
        Payload::InterruptReply => "interrupt_reply",
        Payload::InputRequest { .. } => "input_request",
        Payload::InputReply { .. } => "input_reply",
        Payload::ShutdownRequest { .. } => "shutdown_request",
        Payload::ShutdownReply { .. } => "shutdown_reply",
        Payload::Stream { .. } => "stream",
        Payload::DisplayData(_) => "display_data",
        Payload::ExecuteResult(_) => "execute_result",
        Payload::Error(_) => "error",
        Payload::Status { .. } => "status",
        Payload::ClearOutput { .. } => "clear_output",
    }
}

/// Pipeline state of one summarized request.
struct LiveState {
    summarizer: StreamSummarizer,
    record: ExecutionRecord,
    log: OutputLog,
    cache: ResultCache,
    history: String,
    masking: Option<Regex>,
    forward: Option<ForwardTarget>,
    finalized: bool,
}

enum EntryKind {
    /// Summarize mode off: rewrite and re-emit only.
    Passthrough { masking: Option<Regex> },
    /// Full mask/summarize/log pipeline.
    Summarized(Box<LiveState>),
    /// Router-internal query; buffered by id, never forwarded.
    Query {
        captured: String,
        done: Option<oneshot::Sender<Result<String, RelayError>>>,
    },
}

/// One live correlation: internal request id to caller identity and state.
struct Entry {
    origin: Header,
    kind: EntryKind,
    saw_idle: bool,
    reply: Option<Envelope>,
    done: Option<oneshot::Sender<Result<Envelope, RelayError>>>,
    grace: Option<JoinHandle<()>>,
}

struct Coordinator<E: Engine> {
    engine: E,
    requests: mpsc::Sender<Envelope>,
    input_replies: mpsc::Sender<Envelope>,
    outbound: Arc<OutboundStore>,
    events: mpsc::Sender<Event>,
    workdir: PathBuf,
    log_root: PathBuf,
    grace_period: Duration,
    entries: HashMap<String, Entry>,
    current: Option<String>,
    quiet_queries: usize,
}

impl<E: Engine + 'static> Coordinator<E> {
    async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        while let Some(event) = events.recv().await {
            match event {
                Event::Dispatch { envelope, done } => self.handle_dispatch(envelope, done).await,
                Event::Query { code, done } => self.handle_query(code, done).await,
                Event::Interrupt { done } => self.handle_interrupt(done).await,
                Event::ClientInput { value } => self.handle_client_input(value).await,
                Event::Shutdown { restart, done } => {
                    self.handle_shutdown(restart, done).await;
                    return;
                }
                Event::Reply(envelope) => self.handle_reply(envelope).await,
                Event::Broadcast(envelope) => self.handle_broadcast(envelope).await,
                Event::InputRequest(envelope) => self.handle_input_request(envelope),
                Event::GraceExpired { msg_id } => self.handle_grace_expired(msg_id).await,
                Event::ChannelClosed { channel } => self.handle_channel_closed(channel).await,
            }
        }
    }

    async fn handle_dispatch(
        &mut self,
        envelope: Envelope,
        done: oneshot::Sender<Result<Envelope, RelayError>>,
    ) {
        let request = match envelope.payload {
            Payload::ExecuteRequest(request) => request,
            ref other => {
                let _ = done.send(Err(RelayError::Unsupported(kind_name(other))));
                return;
            }
        };
        if self.current.is_some() {
            let _ = done.send(Err(RelayError::Busy));
            return;
        }
        let origin = envelope.header;

        let config = ConfigSnapshot::resolve(&self.workdir, &request.overrides);
        let cell_id = request.cell_id.clone().or_else(|| config.cell_id.clone());

        let (marker, code) = match strip_force_marker(&request.code) {
            Some(stripped) => (true, stripped.to_string()),
            None => (false, request.code.clone()),
        };
        let summarize_on = !request.silent && config.force_summarize.unwrap_or(marker);

        let internal = Header::fresh();
        let kind = if summarize_on {
            match self.init_live(&code, cell_id.clone(), config).await {
                Ok(state) => EntryKind::Summarized(Box::new(state)),
                Err(e) => {
                    tracing::error!("could not set up request logging: {e}");
                    let _ = done.send(Err(e.into()));
                    return;
                }
            }
        } else {
            EntryKind::Passthrough {
                masking: config.masking,
            }
        };

        let forwarded = Envelope {
            header: internal.clone(),
            parent: None,
            payload: Payload::ExecuteRequest(ExecuteRequest {
                code,
                silent: request.silent,
                allow_stdin: request.allow_stdin,
                cell_id: None,
                overrides: HashMap::new(),
            }),
        };
        if self.requests.send(forwarded).await.is_err() {
            let _ = done.send(Err(RelayError::EngineDisconnected));
            return;
        }

        self.current = Some(internal.msg_id.clone());
        self.entries.insert(
            internal.msg_id.clone(),
            Entry {
                origin,
                kind,
                saw_idle: false,
                reply: None,
                done: Some(done),
                grace: None,
            },
        );
    }

    /// Build the pipeline state of a summarized request: prior history,
    /// execution record, log preamble, and the artifact cache.
    async fn init_live(
        &self,
        code: &str,
        cell_id: Option<String>,
        config: ConfigSnapshot,
    ) -> Result<LiveState, StoreError> {
        let history_records = match cell_id.as_deref() {
            Some(id) => HistoryStore::new(&self.log_root).load(id).await,
            None => Vec::new(),
        };
        let history = HistoryStore::preamble(&history_records);

        let mut summarizer = StreamSummarizer::new(config.limits, config.keywords);
        for warning in config.warnings {
            summarizer.push_warning(warning);
        }

        let mut record = ExecutionRecord::new(code, cell_id.clone());
        let mut log = OutputLog::new(&self.log_root);
        if let Some(cell) = &cell_id {
            log.append(format!("{}\n----\n", serde_json::json!({ "cell_id": cell })));
        }
        log.append(format!("{code}\n----\n"));
        log.flush(true).await?;
        record.log_path = log.path().map(std::path::Path::to_path_buf);
        log.append(format!("{}----\n", record.header_text()));

        let cache = ResultCache::new(record.log_path.as_deref().unwrap_or(self.log_root.as_path()));

        Ok(LiveState {
            summarizer,
            record,
            log,
            cache,
            history,
            masking: config.masking,
            forward: config.forward,
            finalized: false,
        })
    }

    async fn handle_query(
        &mut self,
        code: String,
        done: oneshot::Sender<Result<String, RelayError>>,
    ) {
        let internal = Header::fresh();
        let forwarded = Envelope {
            header: internal.clone(),
            parent: None,
            payload: Payload::ExecuteRequest(ExecuteRequest {
                code,
                silent: true,
                allow_stdin: false,
                cell_id: None,
                overrides: HashMap::new(),
            }),
        };
        if self.requests.send(forwarded).await.is_err() {
            let _ = done.send(Err(RelayError::EngineDisconnected));
            return;
        }
        self.quiet_queries += 1;
        self.entries.insert(
            internal.msg_id.clone(),
            Entry {
                origin: internal,
                kind: EntryKind::Query {
                    captured: String::new(),
                    done: Some(done),
                },
                saw_idle: false,
                reply: None,
                done: None,
                grace: None,
            },
        );
    }

    async fn handle_interrupt(&mut self, done: oneshot::Sender<Result<(), RelayError>>) {
        if let Err(e) = self.engine.interrupt().await {
            let _ = done.send(Err(e.into()));
            return;
        }
        if let Some(id) = self.current.clone() {
            if let Some(entry) = self.entries.get_mut(&id) {
                if let Some(old) = entry.grace.take() {
                    old.abort();
                }
                let events = self.events.clone();
                let delay = self.grace_period;
                entry.grace = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(Event::GraceExpired { msg_id: id }).await;
                }));
            }
        }
        let _ = done.send(Ok(()));
    }

    async fn handle_client_input(&mut self, value: String) {
        let mut envelope = Envelope::new(Payload::InputReply { value });
        envelope.parent = self.current.clone().map(|msg_id| Header { msg_id });
        if self.input_replies.send(envelope).await.is_err() {
            tracing::warn!("input reply dropped: engine input channel closed");
        }
    }

    async fn handle_reply(&mut self, envelope: Envelope) {
        let Some(id) = envelope.parent.as_ref().map(|p| p.msg_id.clone()) else {
            tracing::debug!("dropping reply without parent header");
            return;
        };
        let Some(entry) = self.entries.get_mut(&id) else {
            // Another internal operation's leftover; not ours to answer.
            tracing::debug!(msg_id = %id, "dropping reply for unknown correlation");
            return;
        };
        entry.reply = Some(envelope);
        self.try_complete(&id).await;
    }

    async fn handle_broadcast(&mut self, envelope: Envelope) {
        let Envelope {
            header,
            parent,
            payload,
        } = envelope;
        let Some(id) = parent.map(|p| p.msg_id) else {
            tracing::debug!("dropping broadcast without parent header");
            return;
        };
        let Some(entry) = self.entries.get_mut(&id) else {
            if self.quiet_queries > 0 {
                tracing::trace!(msg_id = %id, "dropping broadcast while internal query in flight");
            } else {
                tracing::debug!(msg_id = %id, "dropping broadcast for unknown correlation");
            }
            return;
        };
        let origin = entry.origin.clone();

        if let Payload::Status { execution_state } = payload {
            if execution_state == ExecutionState::Idle {
                entry.saw_idle = true;
                self.try_complete(&id).await;
            }
            return;
        }

        match &mut entry.kind {
            EntryKind::Passthrough { masking } => {
                let payload = match payload {
                    Payload::Stream { name, text } => Payload::Stream {
                        name,
                        text: mask(&text, masking.as_ref()),
                    },
                    other => other,
                };
                let mut out = Envelope {
                    header,
                    parent: None,
                    payload,
                };
                out.rewrite_correlation(&id, &origin);
                self.outbound.push(out);
            }
            EntryKind::Summarized(state) => match payload {
                Payload::Stream { name, text } => {
                    let masked = mask(&text, state.masking.as_ref());
                    state.log.append(masked.clone());
                    if let Err(e) = state.log.flush(false).await {
                        tracing::error!("log write failed: {e}");
                    }
                    state.record.output_bytes = state.log.bytes_written();

                    match state.summarizer.observe(name, &masked) {
                        FragmentAction::Forward => {
                            let mut out = Envelope {
                                header,
                                parent: None,
                                payload: Payload::Stream { name, text: masked },
                            };
                            out.rewrite_correlation(&id, &origin);
                            self.outbound.push(out);
                        }
                        FragmentAction::Summarize(block) => {
                            self.outbound.push(Envelope::child_of(
                                &origin,
                                Payload::ClearOutput { wait: true },
                            ));
                            let text = format!(
                                "{}{}----\n{}",
                                state.history,
                                state.record.header_text(),
                                block
                            );
                            self.outbound.push(Envelope::child_of(
                                &origin,
                                Payload::Stream {
                                    name: StreamName::Stdout,
                                    text,
                                },
                            ));
                        }
                    }
                }
                rich @ (Payload::DisplayData(_) | Payload::ExecuteResult(_) | Payload::Error(_)) => {
                    if let Err(e) = state.cache.store(&rich).await {
                        tracing::error!("could not cache rich output: {e}");
                    }
                    let mut out = Envelope {
                        header,
                        parent: None,
                        payload: rich,
                    };
                    out.rewrite_correlation(&id, &origin);
                    self.outbound.push(out);
                }
                other => {
                    let mut out = Envelope {
                        header,
                        parent: None,
                        payload: other,
                    };
                    out.rewrite_correlation(&id, &origin);
                    self.outbound.push(out);
                }
            },
            EntryKind::Query { captured, .. } => match payload {
                Payload::Stream {
                    name: StreamName::Stdout,
                    text,
                } => captured.push_str(&text),
                Payload::ExecuteResult(rich) => {
                    if let Some(text) = rich.data.get("text/plain").and_then(|v| v.as_str()) {
                        *captured = text.to_string();
                    }
                }
                _ => {}
            },
        }
    }

    fn handle_input_request(&mut self, envelope: Envelope) {
        let Some(id) = envelope.parent.as_ref().map(|p| p.msg_id.clone()) else {
            return;
        };
        let Some(entry) = self.entries.get(&id) else {
            tracing::debug!(msg_id = %id, "dropping input request for unknown correlation");
            return;
        };
        if matches!(entry.kind, EntryKind::Query { .. }) {
            return;
        }
        let origin = entry.origin.clone();
        let mut out = envelope;
        out.rewrite_correlation(&id, &origin);
        self.outbound.push(out);
    }

    /// Complete a request once both its terminal signals were observed.
    ///
    /// The idle broadcast and the control-plane reply arrive on independent
    /// channels in either order; completion acts only when both are known.
    async fn try_complete(&mut self, id: &str) {
        let ready = self
            .entries
            .get(id)
            .is_some_and(|e| e.saw_idle && e.reply.is_some());
        if !ready {
            return;
        }
        let Some(mut entry) = self.entries.remove(id) else {
            return;
        };
        if let Some(grace) = entry.grace.take() {
            grace.abort();
        }
        if self.current.as_deref() == Some(id) {
            self.current = None;
        }
        let Some(mut reply) = entry.reply.take() else {
            return;
        };

        match entry.kind {
            EntryKind::Query { captured, done } => {
                self.quiet_queries = self.quiet_queries.saturating_sub(1);
                if let Some(done) = done {
                    let _ = done.send(Ok(captured));
                }
                return;
            }
            EntryKind::Passthrough { .. } => {}
            EntryKind::Summarized(mut state) => {
                let status = reply_status(&reply);
                self.finalize_live(&mut state, &entry.origin, id, status)
                    .await;
            }
        }

        reply.rewrite_correlation(id, &entry.origin);
        if let Some(done) = entry.done.take() {
            let _ = done.send(Ok(reply));
        }
    }

    /// Close out a summarized request: stamp the record, flush and close the
    /// log, persist history, and emit the consolidated final view.
    ///
    /// Safe to invoke twice; the grace timer and the normal completion path
    /// may race.
    async fn finalize_live(
        &self,
        state: &mut LiveState,
        origin: &Header,
        internal_id: &str,
        status: RecordStatus,
    ) {
        if state.finalized {
            return;
        }
        state.finalized = true;

        if let Err(e) = state.log.flush(true).await {
            tracing::error!("final log flush failed: {e}");
        }
        state.record.output_bytes = state.log.bytes_written();
        state
            .record
            .finished(state.summarizer.keyword_hits(), status);

        state
            .log
            .append(format!("\n----\n{}----\n", state.record.footer_text()));
        for path in state.cache.files() {
            state.log.append(format!("result: {}\n", path.display()));
        }
        if let Err(e) = state.log.close().await {
            tracing::error!("log close failed: {e}");
        }

        if let Some(cell_id) = state.record.cell_id.clone() {
            let store = HistoryStore::new(&self.log_root);
            if let Err(e) = store.append(&cell_id, state.record.clone()).await {
                tracing::error!(cell_id = %cell_id, "history append failed: {e}");
            }
        }
        if let Some(target) = state.forward.clone() {
            if let Err(e) = LogForwarder::new(target).send(&state.record).await {
                tracing::warn!("record forwarding failed: {e}");
            }
        }

        self.outbound
            .push(Envelope::child_of(origin, Payload::ClearOutput { wait: true }));
        let text = format!(
            "{}{}----\n{}",
            state.history,
            state.record.summary_text(),
            state.summarizer.final_block()
        );
        self.outbound.push(Envelope::child_of(
            origin,
            Payload::Stream {
                name: StreamName::Stdout,
                text,
            },
        ));

        for payload in state.cache.replay_all().await {
            let mut replayed = Envelope::new(payload);
            replayed.rewrite_correlation(internal_id, origin);
            self.outbound.push(replayed);
        }
    }

    /// The engine failed to reach idle within the grace period: finalize
    /// with partial data and release the caller. Anything that still arrives
    /// for this id is dropped as unknown.
    async fn handle_grace_expired(&mut self, msg_id: String) {
        let Some(mut entry) = self.entries.remove(&msg_id) else {
            return;
        };
        tracing::warn!(msg_id = %msg_id, "interrupt grace expired; finalizing with partial output");
        if self.current.as_deref() == Some(msg_id.as_str()) {
            self.current = None;
        }

        match entry.kind {
            EntryKind::Summarized(mut state) => {
                self.finalize_live(&mut state, &entry.origin, &msg_id, RecordStatus::Aborted)
                    .await;
            }
            EntryKind::Query { done, .. } => {
                self.quiet_queries = self.quiet_queries.saturating_sub(1);
                if let Some(done) = done {
                    let _ = done.send(Err(RelayError::Timeout));
                }
                return;
            }
            EntryKind::Passthrough { .. } => {}
        }

        if let Some(done) = entry.done.take() {
            let _ = done.send(Ok(aborted_reply(&entry.origin)));
        }
    }

    async fn handle_channel_closed(&mut self, channel: &'static str) {
        if self.entries.is_empty() {
            return;
        }
        tracing::warn!(channel, "engine channel closed with requests in flight");
        let entries: Vec<(String, Entry)> = self.entries.drain().collect();
        self.current = None;
        self.quiet_queries = 0;
        for (id, mut entry) in entries {
            if let Some(grace) = entry.grace.take() {
                grace.abort();
            }
            match entry.kind {
                EntryKind::Summarized(mut state) => {
                    self.finalize_live(&mut state, &entry.origin, &id, RecordStatus::Aborted)
                        .await;
                    if let Some(done) = entry.done.take() {
                        let _ = done.send(Err(RelayError::EngineDisconnected));
                    }
                }
                EntryKind::Query { done, .. } => {
                    if let Some(done) = done {
                        let _ = done.send(Err(RelayError::EngineDisconnected));
                    }
                }
                EntryKind::Passthrough { .. } => {
                    if let Some(done) = entry.done.take() {
                        let _ = done.send(Err(RelayError::EngineDisconnected));
                    }
                }
            }
        }
    }

    async fn handle_shutdown(
        &mut self,
        restart: bool,
        done: oneshot::Sender<Result<(), RelayError>>,
    ) {
        let entries: Vec<(String, Entry)> = self.entries.drain().collect();
        self.current = None;
        for (id, mut entry) in entries {
            if let Some(grace) = entry.grace.take() {
                grace.abort();
            }
            if let EntryKind::Summarized(mut state) = entry.kind {
                self.finalize_live(&mut state, &entry.origin, &id, RecordStatus::Aborted)
                    .await;
            }
            if let Some(pending) = entry.done.take() {
                let _ = pending.send(Ok(aborted_reply(&entry.origin)));
            }
        }
        let result = self.engine.shutdown(restart).await.map_err(RelayError::from);
        let _ = done.send(result);
    }
}

fn reply_status(reply: &Envelope) -> RecordStatus {
    match &reply.payload {
        Payload::ExecuteReply(content) => match content.status {
            ReplyStatus::Ok => RecordStatus::Ok,
            ReplyStatus::Error => RecordStatus::Error,
            ReplyStatus::Aborted => RecordStatus::Aborted,
        },
        _ => RecordStatus::Ok,
    }
}

fn aborted_reply(origin: &Header) -> Envelope {
    Envelope::child_of(
        origin,
        Payload::ExecuteReply(ExecuteReply {
            status: ReplyStatus::Aborted,
            execution_count: None,
            extra: serde_json::Map::new(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_match_wire_tags() {
        let env = Envelope::new(Payload::InterruptRequest);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["msg_type"], kind_name(&env.payload));
    }

    #[test]
    fn test_default_grace_period() {
        let options = RelayOptions::new("/tmp/x");
        assert_eq!(options.grace_period, Duration::from_secs(5));
        let options = options.grace_period(Duration::from_millis(50));
        assert_eq!(options.grace_period, Duration::from_millis(50));
    }
}
