mod state;
mod event_loop;
mod render;
mod input;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossterm::{
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen, Clear, ClearType},
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::info;

use crate::config::AppConfig;
use crate::control::ControlChannel;
use crate::error::Result;
use crate::lifecycle::Lifecycle;
use crate::registry::NodeRegistry;
use crate::session::Coordinator;
use crate::settings::SettingsStore;
use crate::view::Presenter;

pub use state::{
    FeedObserver, PendingAction, PendingActionKind, StatusFeed, StatusLevel, TextInput, describe_reply,
};

/// Restore the terminal to normal mode. Safe to call multiple times.
pub fn restore_terminal() {
    let _ = execute!(io::stdout(), LeaveAlternateScreen, crossterm::cursor::Show);
    let _ = disable_raw_mode();
}

/// Wire the engine, registry and control channel into a coordinator.
pub fn build_session(rt: Handle, config: &AppConfig, settings: &SettingsStore) -> Coordinator {
    let engine = config.engine();
    let image = config.image_ref(settings.environment());
    let lifecycle = Lifecycle::new(engine.clone(), image, config.data_path.clone())
        .with_pull_timeout(config.pull_timeout);
    let registry = Arc::new(NodeRegistry::open(config.registry_path()));
    Coordinator::new(
        rt,
        registry,
        lifecycle,
        ControlChannel::new(engine),
        config.session.clone(),
    )
}

/// Main application state and event loop.
pub struct App {
    pub session: Coordinator,
    pub feed: Arc<Mutex<StatusFeed>>,
    pub pending_action: Option<PendingAction>,
    pub input: Option<TextInput>,
    /// Where the engine runs, for the header.
    pub target: String,
    pub image: String,
    pub last_tick: Instant,
    pub tick_rate: Duration,
}

impl App {
    pub fn new(mut session: Coordinator, config: &AppConfig, settings: &SettingsStore) -> Self {
        let feed = Arc::new(Mutex::new(StatusFeed::default()));
        session.subscribe(Box::new(FeedObserver(Arc::clone(&feed))));
        let target = if config.command_prefix.is_empty() {
            "local".to_string()
        } else {
            config.command_prefix.join(" ")
        };
        Self {
            session,
            feed,
            pending_action: None,
            input: None,
            target,
            image: config.image_ref(settings.environment()),
            last_tick: Instant::now(),
            tick_rate: Duration::from_millis(250),
        }
    }
}

/// Run the console. Sets up terminal, runs the main loop, restores terminal on exit.
pub fn run(config: &AppConfig, settings: &SettingsStore, should_quit: Arc<AtomicBool>) -> Result<()> {
    let rt = Arc::new(
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(2)
            .build()?,
    );
    let session = build_session(rt.handle().clone(), config, settings);
    let mut app = App::new(session, config, settings);
    info!("Console started against {} with {}", app.target, app.image);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, Clear(ClearType::All))?;

    let result = event_loop(&mut app, &should_quit);

    app.session.shutdown();
    restore_terminal();
    result.map_err(Into::into)
}

fn event_loop(app: &mut App, should_quit: &AtomicBool) -> io::Result<()> {
    let mut needs_render = true;

    loop {
        if should_quit.load(Ordering::Relaxed) {
            break;
        }

        let now = Instant::now();

        if app.expire_pending_action() {
            needs_render = true;
        }
        if app.sync_selection() {
            needs_render = true;
        }
        if app.process_tick() {
            needs_render = true;
        }
        if app.poll_session() {
            needs_render = true;
        }

        if needs_render {
            if Presenter::render_size_guard()? {
                needs_render = false;
                let timeout = app.tick_rate.saturating_sub(now.elapsed());
                if crossterm::event::poll(timeout.min(Duration::from_millis(100)))? {
                    let _ = crossterm::event::read()?;
                }
                continue;
            }

            render::render(app)?;

            if let Some(ref input) = app.input {
                Presenter::render_input(&format!("New alias for {}", input.node), &input.buffer)?;
            } else if let Some(ref pa) = app.pending_action {
                Presenter::render_confirmation(&pa.description)?;
            }

            needs_render = false;
        }

        let timeout = app.tick_rate.saturating_sub(now.elapsed());
        if crossterm::event::poll(timeout.min(Duration::from_millis(100)))? {
            if let crossterm::event::Event::Key(key_event) = crossterm::event::read()? {
                match input::handle_key(app, key_event) {
                    Some(input::InputResult::Quit) => break,
                    Some(input::InputResult::Consumed) => needs_render = true,
                    None => {}
                }
            }
        }
    }

    Ok(())
}
