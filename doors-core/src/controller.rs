//! Sync controller: owns the reassembler and the result ledger, decides when
//! sessions open, and tracks the page lifecycle (active / sleep / dead).
//!
//! The host feeds events in and performs the returned [`Command`]s: opening
//! and aborting sessions, arming timers, reloading the page.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::package::Package;
use crate::reassembler::Reassembler;
use crate::report::Upload;
use crate::timer::{TimerToken, TimerTokens};
use crate::tracker::{ActionExecutor, Tracker};

/// Default idle time before an unflushed page is suspended.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);
/// Default time a hidden page keeps its sessions.
pub const DEFAULT_DISCONNECT_AFTER: Duration = Duration::from_secs(30);
/// Default roll interval of an open session.
pub const DEFAULT_PING: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub ttl: Duration,
    pub disconnect_after: Duration,
    /// A session asks for a roll after this long.
    pub ping: Duration,
    /// Hard cap on concurrently open sessions.
    pub max_sessions: usize,
    /// Sessions may open with nothing to upload while fewer than this are open.
    pub standby_sessions: usize,
    pub backoff: BackoffConfig,
}

impl ControllerConfig {
    /// Per-session deadline, always longer than the roll interval.
    pub fn abort_after(&self) -> Duration {
        self.ping * 4 / 3
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            disconnect_after: DEFAULT_DISCONNECT_AFTER,
            ping: DEFAULT_PING,
            max_sessions: 6,
            standby_sessions: 2,
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Active,
    Sleep,
    Dead,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    /// Stream finished cleanly.
    Ok,
    /// Failed before the server acknowledged the upload.
    Broken,
    /// Failed after the upload was acknowledged.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerTimer {
    Ttl,
    Sleep,
    Backoff,
}

/// Work for the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Open { session: SessionId, upload: Upload },
    Abort(SessionId),
    /// (Re)arm a timer; replaces any earlier arming of the same kind.
    Arm {
        timer: ControllerTimer,
        token: TimerToken,
        after: Duration,
    },
    Disarm { timer: ControllerTimer },
    /// Reload the page. Emitted at most once.
    Reload,
}

pub struct Controller {
    config: ControllerConfig,
    deck: Reassembler,
    tracker: Tracker,
    backoff: Backoff,
    state: PageState,
    /// Open sessions with the upload they carried.
    sessions: BTreeMap<SessionId, Upload>,
    next_session: u64,
    tokens: TimerTokens,
    timers: HashMap<ControllerTimer, TimerToken>,
    loaded: bool,
    visible: bool,
    /// Waiting on the backoff timer.
    rolling: bool,
    reloaded: bool,
    out: Vec<Command>,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        let backoff = Backoff::new(config.backoff.clone());
        Self::with_backoff(config, backoff)
    }

    pub fn with_backoff(config: ControllerConfig, backoff: Backoff) -> Self {
        Self {
            config,
            deck: Reassembler::new(),
            tracker: Tracker::new(),
            backoff,
            state: PageState::Active,
            sessions: BTreeMap::new(),
            next_session: 0,
            tokens: TimerTokens::new(),
            timers: HashMap::new(),
            loaded: false,
            visible: true,
            rolling: false,
            reloaded: false,
            out: Vec::new(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn state(&self) -> PageState {
        self.state
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn cursor(&self) -> u64 {
        self.deck.cursor()
    }

    pub fn reload_requested(&self) -> bool {
        self.reloaded
    }

    /// Arm the ttl timer and open the first session.
    pub fn start(&mut self) -> Vec<Command> {
        self.arm(ControllerTimer::Ttl, self.config.ttl);
        self.connect();
        self.drain()
    }

    /// The page is ready: buffered packages may execute from now on.
    pub fn ready(&mut self, executor: &mut dyn ActionExecutor) -> Vec<Command> {
        self.loaded = true;
        if self.state == PageState::Dead {
            return self.drain();
        }
        self.flush(executor)
    }

    pub fn on_package(&mut self, package: Package) {
        self.deck.insert(package);
    }

    /// Execute the deliverable prefix and roll if anything remains to send.
    pub fn flush(&mut self, executor: &mut dyn ActionExecutor) -> Vec<Command> {
        if !self.loaded {
            return self.drain();
        }
        for package in self.deck.collect() {
            self.tracker.process(&package, executor);
        }
        if self.state != PageState::Dead {
            self.arm(ControllerTimer::Ttl, self.config.ttl);
        }
        if !(self.deck.is_done() && self.tracker.is_done()) {
            self.roll(false, None);
        }
        self.drain()
    }

    /// Roll request from a session's ping timer. Honoured only while it is
    /// the single open session.
    pub fn request_roll(&mut self, session: SessionId) -> Vec<Command> {
        if self.sessions.len() == 1 && self.sessions.contains_key(&session) {
            debug!(session = session.0, "roll requested");
            self.roll(false, None);
        }
        self.drain()
    }

    pub fn on_report(&mut self, session: SessionId, report: Report, now: Instant) -> Vec<Command> {
        let Some(upload) = self.sessions.remove(&session) else {
            return self.drain();
        };
        debug!(session = session.0, ?report, open = self.sessions.len(), "session reported");
        // Every package of this session was inserted before its report, so
        // requested gaps that are still open can be asked for again.
        if !upload.gaps.is_empty() {
            self.deck.return_lost(&upload.gaps);
        }
        match report {
            Report::Broken => self.tracker.give_back(upload.results),
            Report::Ok => self.backoff.reset(now),
            Report::Interrupted => {}
        }
        let open = self.sessions.len();
        if open >= self.config.max_sessions || (open != 0 && report == Report::Ok) {
            return self.drain();
        }
        self.roll(report == Report::Broken, Some(now));
        self.drain()
    }

    /// Instance gone (401/410 or kill signal).
    pub fn on_gone(&mut self) -> Vec<Command> {
        if self.state != PageState::Dead {
            warn!("instance gone");
        }
        self.enter_dead();
        if self.visible {
            self.reload();
        }
        self.drain()
    }

    /// Suspended by the server or ttl; reload on the next interaction.
    pub fn suspend(&mut self) -> Vec<Command> {
        if self.state != PageState::Dead {
            info!("suspended");
            self.enter_dead();
        }
        self.drain()
    }

    pub fn on_hidden(&mut self) -> Vec<Command> {
        self.visible = false;
        if self.state == PageState::Active && !self.timers.contains_key(&ControllerTimer::Sleep) {
            self.arm(ControllerTimer::Sleep, self.config.disconnect_after);
        }
        self.drain()
    }

    pub fn on_page_hide(&mut self) -> Vec<Command> {
        self.sleep();
        self.drain()
    }

    pub fn on_visible(&mut self, now: Instant) -> Vec<Command> {
        self.visible = true;
        self.disarm(ControllerTimer::Sleep);
        if self.state == PageState::Dead {
            self.reload();
            return self.drain();
        }
        self.backoff.reset(now);
        if self.state == PageState::Sleep {
            info!("waking up");
            self.state = PageState::Active;
            if self.sessions.is_empty() {
                self.roll(false, None);
            }
        }
        self.drain()
    }

    /// User interaction; reloads a dead page.
    pub fn on_interaction(&mut self) -> Vec<Command> {
        if self.state == PageState::Dead {
            self.reload();
        }
        self.drain()
    }

    /// A host timer fired. Stale tokens are ignored.
    pub fn on_timer(&mut self, timer: ControllerTimer, token: TimerToken, now: Instant) -> Vec<Command> {
        if self.timers.get(&timer) != Some(&token) {
            return self.drain();
        }
        self.timers.remove(&timer);
        match timer {
            ControllerTimer::Ttl => {
                if self.state != PageState::Dead {
                    info!("ttl expired");
                    self.enter_dead();
                }
            }
            ControllerTimer::Sleep => self.sleep(),
            ControllerTimer::Backoff => {
                self.rolling = false;
                self.backoff.mark(now);
                if self.state == PageState::Active {
                    self.connect();
                }
            }
        }
        self.drain()
    }

    fn roll(&mut self, delayed: bool, now: Option<Instant>) {
        if self.state != PageState::Active || self.rolling {
            return;
        }
        if delayed {
            let now = now.unwrap_or_else(Instant::now);
            if let Some(delay) = self.backoff.next_delay(now) {
                debug!(?delay, "reconnect delayed");
                self.rolling = true;
                self.arm(ControllerTimer::Backoff, delay);
                return;
            }
        }
        self.connect();
    }

    fn connect(&mut self) {
        if self.sessions.len() >= self.config.max_sessions {
            debug!("session cap reached");
            return;
        }
        let results = self.tracker.collect();
        let gaps = self.deck.collect_lost();
        if gaps.is_empty() && results.is_empty() && self.sessions.len() >= self.config.standby_sessions {
            return;
        }
        self.next_session += 1;
        let session = SessionId(self.next_session);
        let upload = Upload { gaps, results };
        debug!(
            session = session.0,
            gaps = upload.gaps.len(),
            results = upload.results.len(),
            "opening session"
        );
        self.sessions.insert(session, upload.clone());
        self.out.push(Command::Open { session, upload });
    }

    fn sleep(&mut self) {
        self.disarm(ControllerTimer::Sleep);
        if self.state != PageState::Active {
            return;
        }
        info!("going to sleep");
        self.state = PageState::Sleep;
        self.abort_sessions();
    }

    fn enter_dead(&mut self) {
        self.state = PageState::Dead;
        self.disarm(ControllerTimer::Ttl);
        self.abort_sessions();
    }

    fn abort_sessions(&mut self) {
        for session in self.sessions.keys() {
            self.out.push(Command::Abort(*session));
        }
    }

    fn reload(&mut self) {
        if self.reloaded {
            return;
        }
        self.reloaded = true;
        self.out.push(Command::Reload);
    }

    fn arm(&mut self, timer: ControllerTimer, after: Duration) {
        let token = self.tokens.issue();
        self.timers.insert(timer, token);
        self.out.push(Command::Arm { timer, token, after });
    }

    fn disarm(&mut self, timer: ControllerTimer) {
        if self.timers.remove(&timer).is_some() {
            self.out.push(Command::Disarm { timer });
        }
    }

    fn drain(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.out)
    }
}
