use std::{io::ErrorKind, net::SocketAddr, sync::Arc, time::Duration};

use color_eyre::{
    Result,
    eyre::{Report, eyre},
};
use crossterm::event::{KeyCode, KeyModifiers};
use serde_json::Value;
use tokio::{select, sync::mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    command,
    config::Config,
    correlator::Correlator,
    dispatch::{DispatchOptions, Dispatcher},
    native::{MissingHost, NativeHost, ProcessHost, ProcessHostConfig},
    server,
    state::{EventLogger, TabId, TabQuery, TabStore},
    tui::{self, AppViewModel, Event, StatusKind, StatusLine, TabEntry, TerminalGuard},
    ui::detail::{build_detail_view, tab_label},
};

const SCROLL_PAGE: usize = 10;

pub struct LicensetapApp {
    tick_rate: Duration,
    correlator: Correlator,
    dispatcher: Dispatcher,
    server: Option<server::ServerHandle>,
    server_addr: SocketAddr,
    headless: bool,
    host_configured: bool,
    selected: Option<usize>,
    visible_tabs: Vec<TabId>,
    detail_scroll: usize,
    status: Option<StatusLine>,
    sends_tx: mpsc::UnboundedSender<SendOutcome>,
    sends_rx: mpsc::UnboundedReceiver<SendOutcome>,
}

#[derive(Debug)]
struct SendOutcome {
    tab: TabId,
    result: Result<(Uuid, Value), String>,
}

impl LicensetapApp {
    pub async fn bootstrap(config: Config) -> Result<Self> {
        let event_logger = config
            .debug_dump
            .as_ref()
            .map(|path| EventLogger::new(path.clone()));
        let store = Arc::new(TabStore::with_event_logger(config.max_tabs, event_logger));
        let correlator = Correlator::new(Arc::clone(&store), config.encoding_policy());

        let native: Arc<dyn NativeHost> = match &config.native_host {
            Some(program) => Arc::new(ProcessHost::new(ProcessHostConfig {
                program: program.clone(),
                args: config.native_host_args.clone(),
                timeout: config.native_timeout(),
            })),
            None => {
                warn!("no native host configured; sendData will report the host as missing");
                Arc::new(MissingHost)
            }
        };

        let dispatcher = Dispatcher::new(
            correlator.clone(),
            store,
            native,
            DispatchOptions {
                delete_me: config.delete_me,
            },
        );

        let bind_addr = config.bind_addr;
        let server = server::spawn(
            correlator.clone(),
            dispatcher.clone(),
            server::ServerConfig { bind_addr },
        )
        .await
        .map_err(|err| match err {
            server::ServerError::Io(io_err) if io_err.kind() == ErrorKind::AddrInUse => eyre!(
                "Port {} is already in use. Pass --bind <addr:port> to choose a different address.",
                bind_addr
            ),
            other => Report::from(other),
        })?;
        let server_addr = server.addr();

        info!(
            addr = %server_addr,
            quote = ?config.quote_style,
            body = ?config.body_encoding,
            "HTTP server ready"
        );

        let (sends_tx, sends_rx) = mpsc::unbounded_channel();

        Ok(Self {
            tick_rate: Duration::from_millis(250),
            correlator,
            dispatcher,
            server: Some(server),
            server_addr,
            headless: config.headless,
            host_configured: config.native_host.is_some(),
            selected: None,
            visible_tabs: Vec::new(),
            detail_scroll: 0,
            status: None,
            sends_tx,
            sends_rx,
        })
    }

    pub async fn run(self) -> Result<()> {
        if self.headless {
            self.run_headless().await
        } else {
            self.run_dashboard().await
        }
    }

    async fn run_headless(mut self) -> Result<()> {
        info!(addr = %self.server_addr, "running headless; press ctrl+c to stop");

        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(?err, "failed to listen for ctrl+c");
        } else {
            info!("received ctrl+c");
        }

        self.shutdown().await
    }

    async fn run_dashboard(mut self) -> Result<()> {
        info!("starting licensetap dashboard");

        let mut terminal = TerminalGuard::new()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let event_handle = tui::spawn_event_loop(tx, self.tick_rate);

        loop {
            let view_model = self.build_view_model().await;
            let tabs_len = view_model.tabs.len();

            terminal.draw(|frame| tui::render_app(frame, &view_model))?;

            let exit_requested = select! {
                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(event) => self.handle_event(event, tabs_len),
                        None => true,
                    }
                }
                Some(outcome) = self.sends_rx.recv() => {
                    self.apply_send_outcome(outcome);
                    false
                }
                ctrl_c = tokio::signal::ctrl_c() => {
                    if let Err(err) = ctrl_c {
                        warn!(?err, "failed to listen for ctrl+c");
                    } else {
                        info!("received ctrl+c");
                    }
                    true
                }
            };

            if exit_requested {
                break;
            }
        }

        drop(terminal);
        drop(rx);

        if let Err(err) = event_handle.await {
            warn!(?err, "terminal event loop task ended unexpectedly");
        }

        self.shutdown().await
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(server) = self.server.take() {
            server.shutdown().await?;
        }

        info!("licensetap shutting down");
        Ok(())
    }

    async fn build_view_model(&mut self) -> AppViewModel {
        let store = self.correlator.store();
        let quote = self.correlator.policy().quote;
        let tabs = store.tabs_snapshot().await;
        let active = store.active_tab().await;

        let previous_selection = self.selected;
        if tabs.is_empty() {
            self.selected = None;
        } else {
            let max_index = tabs.len().saturating_sub(1);
            self.selected = Some(self.selected.unwrap_or(0).min(max_index));
        }
        if self.selected != previous_selection {
            self.detail_scroll = 0;
        }

        self.visible_tabs = tabs.iter().map(|(tab, _)| *tab).collect();

        let entries = tabs
            .iter()
            .map(|(tab, record)| TabEntry {
                tab: *tab,
                ready: command::is_ready(record, quote),
                active: active == Some(*tab),
                label: tab_label(record),
            })
            .collect();

        let detail = self
            .selected
            .and_then(|index| tabs.get(index))
            .map(|(tab, record)| build_detail_view(*tab, record, quote));

        AppViewModel {
            total_tabs: tabs.len(),
            bind_addr: self.server_addr,
            host_configured: self.host_configured,
            tabs: entries,
            selected: self.selected,
            detail,
            detail_scroll: self.detail_scroll,
            status: self.status.clone(),
        }
    }

    fn handle_event(&mut self, event: Event, tabs_len: usize) -> bool {
        let key = match event {
            Event::Input(key) => key,
            Event::Tick | Event::Resize(..) => return false,
        };

        match key.code {
            KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => true,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => true,
            KeyCode::Down | KeyCode::Char('j') => {
                if self.move_selection(1, tabs_len).is_some() {
                    self.detail_scroll = 0;
                }
                false
            }
            KeyCode::Up | KeyCode::Char('k') => {
                if self.move_selection(-1, tabs_len).is_some() {
                    self.detail_scroll = 0;
                }
                false
            }
            KeyCode::PageDown => {
                self.detail_scroll = self.detail_scroll.saturating_add(SCROLL_PAGE);
                false
            }
            KeyCode::PageUp => {
                self.detail_scroll = self.detail_scroll.saturating_sub(SCROLL_PAGE);
                false
            }
            KeyCode::Home => {
                self.detail_scroll = 0;
                false
            }
            KeyCode::Char('s') | KeyCode::Char('S') => {
                self.send_selected();
                false
            }
            _ => false,
        }
    }

    fn move_selection(&mut self, delta: i32, len: usize) -> Option<usize> {
        if len == 0 {
            self.selected = None;
            return None;
        }

        let current = self.selected.unwrap_or(0) as i32;
        let new_index = (current + delta).clamp(0, len.saturating_sub(1) as i32) as usize;
        let changed = self.selected != Some(new_index);
        self.selected = Some(new_index);
        if changed { Some(new_index) } else { None }
    }

    fn send_selected(&mut self) {
        let Some(tab) = self
            .selected
            .and_then(|index| self.visible_tabs.get(index).copied())
        else {
            self.status = Some(StatusLine {
                kind: StatusKind::Error,
                text: "No tab selected".to_string(),
            });
            return;
        };

        self.status = Some(StatusLine {
            kind: StatusKind::Info,
            text: format!("Sending tab {tab} to the native host…"),
        });

        let dispatcher = self.dispatcher.clone();
        let sends_tx = self.sends_tx.clone();
        tokio::spawn(async move {
            let result = dispatcher
                .send_for_tab(tab, None)
                .await
                .map_err(|err| err.to_string());
            let _ = sends_tx.send(SendOutcome { tab, result });
        });
    }

    fn apply_send_outcome(&mut self, outcome: SendOutcome) {
        self.status = Some(match outcome.result {
            Ok((dispatch_id, response)) => StatusLine {
                kind: StatusKind::Success,
                text: format!(
                    "Tab {} sent ({}): {}",
                    outcome.tab,
                    dispatch_id,
                    host_message(&response)
                ),
            },
            Err(error) => StatusLine {
                kind: StatusKind::Error,
                text: format!("Tab {}: {}", outcome.tab, error),
            },
        });
    }
}

fn host_message(response: &Value) -> String {
    response
        .get("message")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| response.to_string())
}
