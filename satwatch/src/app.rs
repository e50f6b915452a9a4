//! Session runtime: wires the connection manager, the view state and user
//! commands into one event loop, and writes snapshots out as NDJSON.

use std::io::{self, Write};
use std::str::FromStr;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::DashboardConfig;
use crate::connection::{ConnectionManager, Connector};
use crate::diagnostics::{SortColumn, SortDirection};
use crate::types::{ConnectionState, StreamMessage};
use crate::view::DashboardViewState;

const COMMAND_QUEUE_CAPACITY: usize = 64;
// Events folded into one snapshot per loop iteration.
const MAX_EVENT_BATCH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Acknowledge(String),
    SelectSatellite(String),
    ClearSelection,
    SelectTab(String),
    SetSort(SortColumn, SortDirection),
    ToggleExpand(String),
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().ok_or_else(|| "empty command".to_string())?;
        let arg = parts.next();
        let cmd = match (verb.to_ascii_lowercase().as_str(), arg) {
            ("ack" | "acknowledge", Some(id)) => Command::Acknowledge(id.to_string()),
            ("select", Some(id)) => Command::SelectSatellite(id.to_string()),
            ("unselect", None) => Command::ClearSelection,
            ("tab", Some(name)) => Command::SelectTab(name.to_string()),
            ("sort", Some(col)) => {
                let column = match col.parse::<SortColumn>() {
                    Ok(column) => column,
                    Err(never) => match never {},
                };
                let direction = match parts.next() {
                    Some(d) => d
                        .parse()
                        .map_err(|_| format!("bad sort direction {d:?} (asc|desc)"))?,
                    None if column == SortColumn::Status => SortDirection::Desc,
                    None => SortDirection::Asc,
                };
                Command::SetSort(column, direction)
            }
            ("expand", Some(row)) => Command::ToggleExpand(row.to_string()),
            ("quit" | "q" | "exit", None) => Command::Quit,
            _ => return Err(format!("unrecognised command {line:?}")),
        };
        if parts.next().is_some() {
            return Err(format!("too many arguments in {line:?}"));
        }
        Ok(cmd)
    }
}

/// Read commands from stdin, one per line. Bad lines are logged and skipped.
pub fn spawn_stdin_commands() -> mpsc::Receiver<Command> {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    warn!("stdin read failed: {err}");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<Command>() {
                Ok(cmd) => {
                    if tx.send(cmd).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!("{err}"),
            }
        }
        debug!("stdin closed");
    });
    rx
}

enum SessionEvent {
    Status(ConnectionState),
    Message(StreamMessage),
    DecodeErrors(u64),
}

fn apply_event(view: &mut DashboardViewState, event: SessionEvent) {
    match event {
        SessionEvent::Status(s) => view.set_connection(s),
        SessionEvent::Message(m) => view.apply(&m),
        SessionEvent::DecodeErrors(total) => view.set_decode_errors(total),
    }
}

pub struct App<W: Write> {
    config: DashboardConfig,
    view: DashboardViewState,
    out: W,
    last_written: Option<u64>,
}

impl<W: Write> App<W> {
    pub fn new(config: DashboardConfig, out: W) -> Self {
        let view = DashboardViewState::new(config.window_capacity);
        Self {
            config,
            view,
            out,
            last_written: None,
        }
    }

    pub fn view(&self) -> &DashboardViewState {
        &self.view
    }

    /// Run until `quit`, ctrl-c, or an output error. The connection is closed on
    /// every exit path.
    pub async fn run<C: Connector>(
        &mut self,
        connector: C,
        mut commands: mpsc::Receiver<Command>,
    ) -> io::Result<()> {
        let mut manager = ConnectionManager::new(connector, self.config.reconnect.clone());
        // one channel keeps status changes and messages in arrival order
        let (tx, mut events) = mpsc::unbounded_channel();
        let status_tx = tx.clone();
        manager.on_status(move |s| {
            let _ = status_tx.send(SessionEvent::Status(s));
        });
        let decode_tx = tx.clone();
        manager.on_decode_error(move |total| {
            let _ = decode_tx.send(SessionEvent::DecodeErrors(total));
        });
        manager.on_message(move |m| {
            let _ = tx.send(SessionEvent::Message(m.clone()));
        });
        manager.connect();
        info!("session started");

        let res = self.event_loop(&mut events, &mut commands).await;

        manager.close().await;
        if res.is_ok() {
            // final state after the last event
            self.flush_snapshot()?;
        }
        info!("session ended");
        res
    }

    async fn event_loop(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
        commands: &mut mpsc::Receiver<Command>,
    ) -> io::Result<()> {
        let mut retention = interval(self.config.retention_tick);
        retention.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        loop {
            self.flush_snapshot()?;
            tokio::select! {
                Some(event) = events.recv() => {
                    // fold whatever else is already queued into the same snapshot
                    self.view.batch(|view| {
                        apply_event(view, event);
                        for _ in 1..MAX_EVENT_BATCH {
                            match events.try_recv() {
                                Ok(event) => apply_event(view, event),
                                Err(_) => break,
                            }
                        }
                    });
                }
                cmd = commands.recv(), if commands_open => {
                    match cmd {
                        Some(Command::Quit) => break,
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            debug!("command source closed; continuing read-only");
                            commands_open = false;
                        }
                    }
                }
                _ = retention.tick() => self.expire_anomalies(),
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted");
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn handle_command(&mut self, cmd: Command) {
        debug!("command: {cmd:?}");
        match cmd {
            Command::Acknowledge(id) => self.view.acknowledge(&id),
            Command::SelectSatellite(id) => self.view.select_satellite(&id),
            Command::ClearSelection => self.view.clear_selection(),
            Command::SelectTab(name) => self.view.select_tab(&name),
            Command::SetSort(column, direction) => self.view.set_sort(column, direction),
            Command::ToggleExpand(row) => self.view.toggle_expand(&row),
            Command::Quit => {}
        }
    }

    fn expire_anomalies(&mut self) {
        let Ok(retention) = chrono::Duration::from_std(self.config.anomaly_retention) else {
            return;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return;
        };
        let removed = self.view.prune_anomalies_before(cutoff);
        if removed > 0 {
            debug!("expired {removed} anomalies older than {cutoff}");
        }
    }

    /// Write the current snapshot if it changed since the last write.
    pub fn flush_snapshot(&mut self) -> io::Result<()> {
        let snap = self.view.snapshot();
        if self.last_written == Some(snap.revision) {
            return Ok(());
        }
        serde_json::to_writer(&mut self.out, &*snap)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        self.last_written = Some(snap.revision);
        Ok(())
    }
}
