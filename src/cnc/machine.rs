use std::{path::Path, time::Duration};

use async_stream::stream;
use futures::Stream;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    select, spawn,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{sleep, sleep_until, timeout_at, Instant},
};
use tracing::{debug, error, info, warn};

use super::{
    command::CommandStatus,
    connection::{BoxedReader, BoxedWriter, Transport},
    events::MachineEvent,
    grbl::{
        config::GrblConfig,
        messages::{CommandResponse, GrblMessage},
        parser::parse_setting_line,
        version::GrblVersion,
    },
    program::Program,
    scheduler::HistoryRow,
    streamer::{DiagnosticProgress, JogDirection, MachineSnapshot, Streamer},
    threading::{StreamingMode, ThreadingMode},
};
use crate::{
    error::{StreamerError, StreamerResult},
    settings::Settings,
    util::history_broadcast::{self, ReceiverError},
};

const EVENT_HISTORY: usize = 256;
const CONFIG_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const CONFIG_QUIET: Duration = Duration::from_millis(500);
const CONFIG_COLLECT_LIMIT: Duration = Duration::from_secs(5);
const CONFIG_WRITE_IDLE: Duration = Duration::from_secs(10);

type Reply<T> = oneshot::Sender<StreamerResult<T>>;

enum Request {
    Connect(Reply<()>),
    Disconnect { wipe_history: bool, result: Reply<()> },
    PrepareLoad(Reply<f64>),
    LoadProgram(Program, Reply<()>),
    RunProgram(Reply<()>),
    RunFrom { position: usize, homing: bool, result: Reply<()> },
    Abort(Reply<()>),
    FeedHold(Reply<()>),
    CycleStart(Reply<()>),
    Reset(Reply<()>),
    BeginJog(JogDirection, Reply<()>),
    EndJog(Reply<()>),
    Manual(String, Reply<()>),
    SetOverrides {
        feed: Option<u16>,
        rapid: Option<u16>,
        spindle: Option<u16>,
        result: Reply<()>,
    },
    SetLoopCount(u32, Reply<()>),
    SetStreamingMode(StreamingMode, Reply<()>),
    SetThreadingMode(ThreadingMode, Reply<()>),
    BeginDiagnostic(Vec<String>, Reply<DiagnosticSession>),
    StoreConfig(GrblConfig, Reply<()>),
    ClearHistory(Reply<()>),
    Snapshot(Reply<MachineSnapshot>),
    History { start: usize, count: usize, result: Reply<Vec<HistoryRow>> },
}

enum InboundEvent {
    Line(String),
    Closed,
    Failed(std::io::Error),
}

// Tagged with the connection it came from, so a late line from a closed link is dropped.
struct Inbound {
    generation: u64,
    event: InboundEvent,
}

/*
    Reads newline terminated lines until the link closes. Between lines it naps for
the receive period of the current threading mode, shorter when more data is already
buffered.
*/
async fn read_lines(
    reader: BoxedReader,
    generation: u64,
    sender: mpsc::Sender<Inbound>,
    threading: watch::Receiver<ThreadingMode>,
) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        let event = match reader.read_until(b'\n', &mut line).await {
            Ok(0) => InboundEvent::Closed,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line).trim().to_string();
                if text.is_empty() {
                    continue;
                }
                InboundEvent::Line(text)
            }
            Err(e) => InboundEvent::Failed(e),
        };
        let last = !matches!(event, InboundEvent::Line(_));
        if sender.send(Inbound { generation, event }).await.is_err() || last {
            return;
        }
        let profile = threading.borrow().profile();
        let pause = if reader.buffer().is_empty() {
            profile.rx_long
        } else {
            profile.rx_short
        };
        if !pause.is_zero() {
            sleep(pause).await;
        }
    }
}

struct MachineThread {
    streamer: Streamer,
    transport: Box<dyn Transport>,
    writer: Option<BoxedWriter>,
    reader_task: Option<JoinHandle<()>>,
    generation: u64,
    inbound_sender: mpsc::Sender<Inbound>,
    threading: watch::Sender<ThreadingMode>,
    events: history_broadcast::Sender<MachineEvent>,
    diagnostic: Option<watch::Sender<DiagnosticProgress>>,
}

impl MachineThread {
    async fn run(mut self, mut requests: mpsc::Receiver<Request>, mut inbound: mpsc::Receiver<Inbound>) {
        let mut next_tick = Instant::now();
        loop {
            select! {
                line = inbound.recv() => {
                    if let Some(line) = line {
                        self.on_inbound(line);
                    }
                },
                request = requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                _ = sleep_until(next_tick) => {
                    let now = Instant::now();
                    next_tick = now + self.streamer.tick(now);
                },
            }
            self.flush().await;
        }
        info!("all machine handles dropped, stopping");
        if self.writer.is_some() {
            self.close_transport(true);
        }
        self.flush().await;
    }

    fn on_inbound(&mut self, inbound: Inbound) {
        if inbound.generation != self.generation || self.writer.is_none() {
            debug!("dropping input from a closed connection");
            return;
        }
        match inbound.event {
            InboundEvent::Line(line) => self.streamer.receive_line(&line, Instant::now()),
            InboundEvent::Closed => {
                warn!("{} closed by the other side", self.transport.describe());
                self.close_transport(false);
            }
            InboundEvent::Failed(e) => {
                error!("reading from {} failed: {}", self.transport.describe(), e);
                self.close_transport(false);
            }
        }
    }

    fn close_transport(&mut self, user: bool) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.writer = None;
        self.streamer.on_disconnected(user, Instant::now());
        info!("disconnected from {}", self.transport.describe());
    }

    async fn connect(&mut self) -> StreamerResult<()> {
        let now = Instant::now();
        self.streamer.begin_connect(now)?;
        let (reader, writer) = match self.transport.open().await {
            Ok(halves) => halves,
            Err(e) => {
                error!("could not open {}: {}", self.transport.describe(), e);
                self.streamer.on_disconnected(true, Instant::now());
                return Err(e.into());
            }
        };
        self.generation += 1;
        self.reader_task = Some(spawn(read_lines(
            reader,
            self.generation,
            self.inbound_sender.clone(),
            self.threading.subscribe(),
        )));
        self.writer = Some(writer);
        self.streamer.on_connected(Instant::now());
        info!("connected to {}", self.transport.describe());
        Ok(())
    }

    async fn handle(&mut self, request: Request) {
        // A session dropped by its client must be released before the next request.
        self.sync_diagnostic();
        let now = Instant::now();
        let streamer = &mut self.streamer;
        match request {
            Request::Connect(result) => {
                let outcome = self.connect().await;
                drop(result.send(outcome));
            }
            Request::Disconnect { wipe_history, result } => {
                if self.writer.is_some() {
                    self.close_transport(true);
                }
                if wipe_history {
                    self.streamer.clear_history();
                }
                drop(result.send(Ok(())));
            }
            Request::PrepareLoad(result) => drop(result.send(streamer.begin_program_load())),
            Request::LoadProgram(program, result) => drop(result.send(streamer.set_program(program))),
            Request::RunProgram(result) => drop(result.send(streamer.run_program(now))),
            Request::RunFrom { position, homing, result } => {
                drop(result.send(streamer.run_from(position, homing, now)))
            }
            Request::Abort(result) => drop(result.send(streamer.abort(now))),
            Request::FeedHold(result) => drop(result.send(streamer.feed_hold(false))),
            Request::CycleStart(result) => drop(result.send(streamer.cycle_start())),
            Request::Reset(result) => drop(result.send(streamer.reset(now))),
            Request::BeginJog(direction, result) => drop(result.send(streamer.begin_jog(direction))),
            Request::EndJog(result) => {
                streamer.end_jog();
                drop(result.send(Ok(())));
            }
            Request::Manual(text, result) => drop(result.send(streamer.send_manual(&text))),
            Request::SetOverrides {
                feed,
                rapid,
                spindle,
                result,
            } => {
                streamer.set_override_targets(feed, rapid, spindle);
                drop(result.send(Ok(())));
            }
            Request::SetLoopCount(count, result) => {
                streamer.set_loop_count(count);
                drop(result.send(Ok(())));
            }
            Request::SetStreamingMode(mode, result) => {
                drop(result.send(streamer.set_streaming_mode(mode)))
            }
            Request::SetThreadingMode(mode, result) => {
                let outcome = streamer.set_threading_mode(mode);
                self.threading.send_replace(mode);
                drop(result.send(outcome));
            }
            Request::BeginDiagnostic(lines, result) => {
                let outcome = streamer.begin_diagnostic(&lines, now).map(|()| {
                    let (sender, progress) = watch::channel(streamer.diagnostic_progress());
                    self.diagnostic = Some(sender);
                    DiagnosticSession {
                        progress,
                        version: streamer.version(),
                    }
                });
                drop(result.send(outcome));
            }
            Request::StoreConfig(config, result) => drop(result.send(streamer.store_config(config))),
            Request::ClearHistory(result) => {
                streamer.clear_history();
                drop(result.send(Ok(())));
            }
            Request::Snapshot(result) => drop(result.send(Ok(streamer.snapshot(now)))),
            Request::History { start, count, result } => {
                drop(result.send(Ok(streamer.history_range(start, count))))
            }
        }
    }

    // Everything the last step produced: bytes to the wire, events to subscribers.
    async fn flush(&mut self) {
        let outbox = self.streamer.take_outbox();
        if !outbox.is_empty() {
            if let Some(writer) = &mut self.writer {
                let written = async {
                    writer.write_all(&outbox).await?;
                    writer.flush().await
                }
                .await;
                match written {
                    Ok(()) => self.streamer.mark_written(),
                    Err(e) => {
                        error!("writing to {} failed: {}", self.transport.describe(), e);
                        self.close_transport(false);
                    }
                }
            }
        }
        if self.streamer.take_close_request() {
            self.close_transport(false);
        }
        for event in self.streamer.take_events() {
            self.events.send(event);
        }
        if self.streamer.settings().is_dirty() {
            if let Err(e) = self.streamer.settings_mut().flush().await {
                error!("could not save settings: {}", e);
            }
        }
        self.sync_diagnostic();
    }

    fn sync_diagnostic(&mut self) {
        let Some(sender) = &self.diagnostic else {
            return;
        };
        if sender.is_closed() {
            self.streamer.end_diagnostic();
            self.diagnostic = None;
            return;
        }
        let progress = self.streamer.diagnostic_progress();
        let active = progress.active;
        sender.send_if_modified(|current| {
            if *current == progress {
                return false;
            }
            *current = progress;
            true
        });
        if !active {
            self.diagnostic = None;
        }
    }
}

/*
    Exclusive use of the link for a config exchange. The engine keeps the session open
as long as this value lives, and hands the normal queues back once it is dropped.
*/
pub struct DiagnosticSession {
    progress: watch::Receiver<DiagnosticProgress>,
    version: Option<GrblVersion>,
}

impl DiagnosticSession {
    pub fn version(&self) -> Option<GrblVersion> {
        self.version
    }
    pub fn progress(&self) -> DiagnosticProgress {
        self.progress.borrow().clone()
    }
    /*
        Waits until `done` holds. With `restart_on_change` the limit applies to silence
    between updates rather than to the whole wait.
    */
    pub async fn wait_until(
        &mut self,
        limit: Duration,
        restart_on_change: bool,
        what: &'static str,
        done: impl Fn(&DiagnosticProgress) -> bool,
    ) -> StreamerResult<DiagnosticProgress> {
        let mut deadline = Instant::now() + limit;
        loop {
            let progress = self.progress.borrow_and_update().clone();
            if !progress.active {
                return Err(StreamerError::SessionClosed);
            }
            if done(&progress) {
                return Ok(progress);
            }
            match timeout_at(deadline, self.progress.changed()).await {
                Err(_) => return Err(StreamerError::Timeout(what)),
                Ok(Err(_)) => return Err(StreamerError::SessionClosed),
                Ok(Ok(())) => {}
            }
            if restart_on_change {
                deadline = Instant::now() + limit;
            }
        }
    }
}

fn first_command(progress: &DiagnosticProgress) -> Option<&super::command::Command> {
    progress.rows.iter().find_map(|row| match row {
        HistoryRow::Command(command) => Some(command),
        _ => None,
    })
}

fn describe_response(response: Option<CommandResponse>) -> String {
    match response {
        Some(CommandResponse::Error(Some(code))) => {
            format!("error:{} {}", code, GrblMessage::get_error_text(code))
        }
        Some(CommandResponse::Error(None)) => "error".to_string(),
        Some(CommandResponse::Ok) => "ok".to_string(),
        None => "no response".to_string(),
    }
}

/*
    Cheap to clone; every clone talks to the same machine thread. The thread stops once
the last handle is gone.
*/
#[derive(Clone)]
pub struct MachineHandle {
    requests: mpsc::Sender<Request>,
    events: history_broadcast::Receiver<MachineEvent>,
}

impl MachineHandle {
    pub fn spawn(settings: Settings, transport: impl Transport + 'static) -> MachineHandle {
        let (request_sender, request_receiver) = mpsc::channel(64);
        let (inbound_sender, inbound_receiver) = mpsc::channel(256);
        let events = history_broadcast::Sender::new(EVENT_HISTORY);
        let handle = MachineHandle {
            requests: request_sender,
            events: events.subscribe_with_history_count(0),
        };
        let (threading, _) = watch::channel(settings.threading_mode());
        let thread = MachineThread {
            streamer: Streamer::new(settings, Instant::now()),
            transport: Box::new(transport),
            writer: None,
            reader_task: None,
            generation: 0,
            inbound_sender,
            threading,
            events,
            diagnostic: None,
        };
        spawn(thread.run(request_receiver, inbound_receiver));
        handle
    }

    async fn call<T>(&self, request: impl FnOnce(Reply<T>) -> Request) -> StreamerResult<T> {
        let (sender, receiver) = oneshot::channel();
        self.requests
            .send(request(sender))
            .await
            .map_err(|_| StreamerError::EngineStopped)?;
        receiver.await.map_err(|_| StreamerError::EngineStopped)?
    }

    /*
        Connection
    */
    pub async fn connect(&self) -> StreamerResult<()> {
        self.call(Request::Connect).await
    }
    pub async fn disconnect(&self, wipe_history: bool) -> StreamerResult<()> {
        self.call(|result| Request::Disconnect { wipe_history, result }).await
    }

    /*
        Program
    */
    pub async fn load_program(&self, path: impl AsRef<Path>) -> StreamerResult<()> {
        let rapid_rate = self.call(Request::PrepareLoad).await?;
        let program = Program::load_file(path, rapid_rate).await?;
        self.call(|result| Request::LoadProgram(program, result)).await
    }
    pub async fn load_program_text(&self, text: &str) -> StreamerResult<()> {
        let rapid_rate = self.call(Request::PrepareLoad).await?;
        let program = Program::from_text(text, rapid_rate);
        self.call(|result| Request::LoadProgram(program, result)).await
    }
    pub async fn run_program(&self) -> StreamerResult<()> {
        self.call(Request::RunProgram).await
    }
    pub async fn run_from(&self, position: usize, homing: bool) -> StreamerResult<()> {
        self.call(|result| Request::RunFrom {
            position,
            homing,
            result,
        })
        .await
    }
    pub async fn abort(&self) -> StreamerResult<()> {
        self.call(Request::Abort).await
    }
    pub async fn set_loop_count(&self, count: u32) -> StreamerResult<()> {
        self.call(|result| Request::SetLoopCount(count, result)).await
    }

    /*
        Immediate commands
    */
    pub async fn feed_hold(&self) -> StreamerResult<()> {
        self.call(Request::FeedHold).await
    }
    pub async fn cycle_start(&self) -> StreamerResult<()> {
        self.call(Request::CycleStart).await
    }
    pub async fn reset(&self) -> StreamerResult<()> {
        self.call(Request::Reset).await
    }
    pub async fn begin_jog(&self, direction: JogDirection) -> StreamerResult<()> {
        self.call(|result| Request::BeginJog(direction, result)).await
    }
    pub async fn end_jog(&self) -> StreamerResult<()> {
        self.call(Request::EndJog).await
    }
    pub async fn manual_command(&self, text: impl Into<String>) -> StreamerResult<()> {
        let text = text.into();
        self.call(|result| Request::Manual(text, result)).await
    }
    pub async fn set_overrides(
        &self,
        feed: Option<u16>,
        rapid: Option<u16>,
        spindle: Option<u16>,
    ) -> StreamerResult<()> {
        self.call(|result| Request::SetOverrides {
            feed,
            rapid,
            spindle,
            result,
        })
        .await
    }
    pub async fn set_streaming_mode(&self, mode: StreamingMode) -> StreamerResult<()> {
        self.call(|result| Request::SetStreamingMode(mode, result)).await
    }
    pub async fn set_threading_mode(&self, mode: ThreadingMode) -> StreamerResult<()> {
        self.call(|result| Request::SetThreadingMode(mode, result)).await
    }

    /*
        Firmware configuration
    */
    pub async fn begin_diagnostic(&self, lines: Vec<String>) -> StreamerResult<DiagnosticSession> {
        self.call(|result| Request::BeginDiagnostic(lines, result)).await
    }
    // Reads the `$$` table and stores it in the settings.
    pub async fn read_config(&self) -> StreamerResult<GrblConfig> {
        let mut session = self.begin_diagnostic(vec!["$$".to_string()]).await?;
        let progress = session
            .wait_until(CONFIG_ACK_TIMEOUT, false, "the $$ response", |progress| {
                first_command(progress).map_or(false, |command| command.status().is_terminal())
            })
            .await?;
        if let Some(command) = first_command(&progress) {
            if command.status() == CommandStatus::ResponseBad {
                return Err(StreamerError::ConfigRejected(describe_response(command.response())));
            }
        }

        let mut config = GrblConfig::new(session.version());
        let expected = config.expected_count();
        let give_up = Instant::now() + CONFIG_COLLECT_LIMIT;
        let progress = loop {
            let progress = session.progress.borrow_and_update().clone();
            if progress.rows.len() > expected {
                break progress;
            }
            let quiet = (Instant::now() + CONFIG_QUIET).min(give_up);
            match timeout_at(quiet, session.progress.changed()).await {
                Err(_) => break progress,
                Ok(Err(_)) => return Err(StreamerError::SessionClosed),
                Ok(Ok(())) => {}
            }
        };
        drop(session);

        for row in &progress.rows {
            if let HistoryRow::Message { text, .. } = row {
                if let Some((number, value)) = parse_setting_line(text) {
                    config.insert(number, value);
                }
            }
        }
        if config.len() < expected {
            return Err(StreamerError::ConfigIncomplete {
                found: config.len(),
                expected,
            });
        }
        info!("read {} grbl settings", config.len());
        let stored = config.clone();
        self.call(|result| Request::StoreConfig(stored, result)).await?;
        Ok(config)
    }
    // Writes every setting of `config`; rejected lines come back in the error.
    pub async fn write_config(&self, config: &GrblConfig) -> StreamerResult<()> {
        let mut session = self.begin_diagnostic(config.to_commands()).await?;
        let progress = session
            .wait_until(CONFIG_WRITE_IDLE, true, "the configuration write", |progress| {
                progress.drained
            })
            .await?;
        drop(session);
        let rejected: Vec<String> = progress
            .rows
            .iter()
            .filter_map(|row| match row {
                HistoryRow::Command(command) if command.status() != CommandStatus::ResponseGood => {
                    Some(format!("{} {}", command.text(), describe_response(command.response())))
                }
                _ => None,
            })
            .collect();
        if !rejected.is_empty() {
            return Err(StreamerError::WriteConfig(rejected));
        }
        let stored = config.clone();
        self.call(|result| Request::StoreConfig(stored, result)).await
    }

    /*
        Observation
    */
    pub async fn clear_history(&self) -> StreamerResult<()> {
        self.call(Request::ClearHistory).await
    }
    pub async fn snapshot(&self) -> StreamerResult<MachineSnapshot> {
        self.call(Request::Snapshot).await
    }
    pub async fn history(&self, start: usize, count: usize) -> StreamerResult<Vec<HistoryRow>> {
        self.call(|result| Request::History { start, count, result }).await
    }
    pub fn subscribe(&self, history: usize) -> history_broadcast::Receiver<MachineEvent> {
        self.events.subscribe_with_history_count(history)
    }
    // Events from now on, plus up to `history` recent ones. Ends when the machine thread stops.
    pub fn events(&self, history: usize) -> impl Stream<Item = MachineEvent> + Send + 'static {
        let mut receiver = self.subscribe(history);
        stream! {
            loop {
                match receiver.recv().await {
                    Ok(event) => yield event,
                    Err(ReceiverError::Lagged(missed)) => warn!("event subscriber fell behind, {} events lost", missed),
                    Err(ReceiverError::Closed) => break,
                }
            }
        }
    }
}
