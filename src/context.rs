//! Process-wide application context.
//!
//! The context is an explicitly owned aggregate passed by [`Arc`] to every
//! component constructor (no compiled-in global), so tests can build isolated
//! contexts with fake collaborators. It is created once at startup and lives
//! until power-off; there is no teardown path.

use crate::config::AudioParams;
use crate::identity;
use crate::state::StateCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;
use tokio::sync::Semaphore;

/// Maximum stored length of the server-issued session id, in bytes.
pub const MAX_SESSION_ID_LEN: usize = 9;

/// Negotiated per-session values delivered by the server hello.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    /// Server-issued session token (truncated to [`MAX_SESSION_ID_LEN`]).
    pub session_id: String,
    /// Negotiated audio parameters.
    pub audio: AudioParams,
}

/// Shared state of the single streaming connection.
pub struct ConnectionSession {
    connected: AtomicBool,
    info: Mutex<SessionInfo>,
    /// Serializes all transport writes (audio frames and control messages).
    pub write_lock: tokio::sync::Mutex<()>,
    /// Released exactly once per successful handshake; drained before each
    /// connect attempt so stale signals cannot satisfy a new wait.
    pub handshake: Semaphore,
}

impl ConnectionSession {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            info: Mutex::new(SessionInfo::default()),
            write_lock: tokio::sync::Mutex::new(()),
            handshake: Semaphore::new(0),
        }
    }

    /// Whether the connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Flip the connected flag.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Current session id (empty when no session is active).
    pub fn session_id(&self) -> String {
        match self.info.lock() {
            Ok(info) => info.session_id.clone(),
            Err(p) => p.into_inner().session_id.clone(),
        }
    }

    /// Negotiated audio parameters.
    pub fn audio_params(&self) -> AudioParams {
        match self.info.lock() {
            Ok(info) => info.audio,
            Err(p) => p.into_inner().audio,
        }
    }

    /// Record the server hello: session id (truncated) and audio parameters.
    pub fn set_session(&self, session_id: &str, audio: AudioParams) {
        let mut truncated = session_id.to_owned();
        if truncated.len() > MAX_SESSION_ID_LEN {
            // Truncate on a char boundary; session ids are ASCII in practice.
            let mut cut = MAX_SESSION_ID_LEN;
            while !truncated.is_char_boundary(cut) {
                cut -= 1;
            }
            truncated.truncate(cut);
        }
        let mut info = match self.info.lock() {
            Ok(i) => i,
            Err(p) => p.into_inner(),
        };
        info.session_id = truncated;
        info.audio = audio;
    }

    /// Release the handshake signal (one permit).
    pub fn signal_handshake(&self) {
        self.handshake.add_permits(1);
    }

    /// Discard any stale handshake permits left over from a previous attempt.
    pub fn drain_handshake(&self) {
        while let Ok(permit) = self.handshake.try_acquire() {
            permit.forget();
        }
    }

    /// Re-initialize for a fresh connect attempt: drop the connected flag
    /// and clear stale handshake signals. Session info is overwritten by the
    /// next server hello.
    pub fn reset(&self) {
        self.set_connected(false);
        self.drain_handshake();
    }
}

/// Mutual-exclusion and rate-limit state for the reconnect policy.
pub struct ReconnectState {
    in_progress: AtomicBool,
    last_attempt: Mutex<Option<Instant>>,
}

impl ReconnectState {
    fn new() -> Self {
        Self {
            in_progress: AtomicBool::new(false),
            last_attempt: Mutex::new(None),
        }
    }

    /// Whether a reconnect attempt is currently running.
    ///
    /// Best-effort guard: this flag is checked without holding the write
    /// lock that `reconnect()` itself uses, so a disconnect callback racing a
    /// just-started reconnect may read a stale `false`. Kept as in the
    /// observed design; the consistency repair closes the window on the next
    /// local event.
    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Set or clear the in-progress flag, returning the previous value.
    pub fn set_in_progress(&self, value: bool) -> bool {
        self.in_progress.swap(value, Ordering::SeqCst)
    }

    /// Whether at least `cooldown_ms` elapsed since the last attempt.
    pub fn cooldown_elapsed(&self, cooldown_ms: u64) -> bool {
        let last = match self.last_attempt.lock() {
            Ok(l) => *l,
            Err(p) => *p.into_inner(),
        };
        match last {
            Some(at) => at.elapsed().as_millis() >= u128::from(cooldown_ms),
            None => true,
        }
    }

    /// Record the start of a reconnect attempt for rate limiting.
    pub fn mark_attempt(&self) {
        let mut last = match self.last_attempt.lock() {
            Ok(l) => l,
            Err(p) => p.into_inner(),
        };
        *last = Some(Instant::now());
    }

    /// Clear the rate-limit gate so the next reconnect runs immediately
    /// (used after an observed disconnect).
    pub fn clear_cooldown(&self) {
        let mut last = match self.last_attempt.lock() {
            Ok(l) => l,
            Err(p) => p.into_inner(),
        };
        *last = None;
    }
}

/// Process-wide context aggregating device state, connection state, and the
/// one-time initialization flags.
pub struct AppContext {
    /// Authoritative device state.
    pub state: StateCell,
    /// Streaming connection state.
    pub session: ConnectionSession,
    /// Reconnect policy state.
    pub reconnect: ReconnectState,
    /// MAC-derived hardware identifier (`aa:bb:cc:dd:ee:ff`).
    pub device_id: String,
    client_id: OnceLock<String>,
    /// Audio subsystem brought up (codec/encoder). One-time.
    pub audio_initialized: AtomicBool,
    /// IoT registry initialized. One-time.
    pub iot_initialized: AtomicBool,
    /// Wake word initialized for the current logical session; reset by
    /// `goodbye`.
    pub wakeword_session_init: AtomicBool,
}

impl AppContext {
    /// Create a fresh context in the default/unknown state.
    #[must_use]
    pub fn new(device_id: String) -> Self {
        Self {
            state: StateCell::new(),
            session: ConnectionSession::new(),
            reconnect: ReconnectState::new(),
            device_id,
            client_id: OnceLock::new(),
            audio_initialized: AtomicBool::new(false),
            iot_initialized: AtomicBool::new(false),
            wakeword_session_init: AtomicBool::new(false),
        }
    }

    /// Client identifier, derived once on first use and cached for the
    /// process lifetime.
    pub fn client_id(&self) -> &str {
        self.client_id.get_or_init(identity::new_client_id)
    }
}
