//! In-memory fakes for the hardware seams and the transport, plus a
//! pre-wired test rig.
//!
//! Compiled into the library so both unit tests and integration tests can
//! share one set of fakes. Nothing here touches real hardware or sockets.

use crate::config::{ConnectionConfig, DeviceConfig};
use crate::connection::ConnectionManager;
use crate::context::AppContext;
use crate::dispatch::MessageDispatcher;
use crate::error::{DeviceError, Result};
use crate::hardware::{
    AudioHardware, Display, IotSubsystem, McpHandler, Peripherals, WakeWordDetector,
};
use crate::transport::{FrameKind, LinkState, Transport, TransportEvent};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Scriptable in-memory [`Transport`].
pub struct FakeTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    link: Mutex<LinkState>,
    auto_handshake: AtomicBool,
    fail_connects: AtomicBool,
    fail_writes_closed: AtomicBool,
    connect_delay_ms: AtomicU64,
    connects: AtomicUsize,
    closes: AtomicUsize,
    texts: Mutex<Vec<String>>,
    binaries: Mutex<Vec<Vec<u8>>>,
}

impl FakeTransport {
    /// Create a fake delivering events on `events`.
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            events,
            link: Mutex::new(LinkState::Closed),
            auto_handshake: AtomicBool::new(false),
            fail_connects: AtomicBool::new(false),
            fail_writes_closed: AtomicBool::new(false),
            connect_delay_ms: AtomicU64::new(0),
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            texts: Mutex::new(Vec::new()),
            binaries: Mutex::new(Vec::new()),
        }
    }

    /// When set, every successful connect emits `Connected` with status 101.
    pub fn auto_handshake(&self, on: bool) {
        self.auto_handshake.store(on, Ordering::SeqCst);
    }

    /// When set, every connect attempt fails.
    pub fn fail_connects(&self, on: bool) {
        self.fail_connects.store(on, Ordering::SeqCst);
    }

    /// From now on every write fails as if the peer closed the connection.
    pub fn fail_writes_with_close(&self) {
        self.fail_writes_closed.store(true, Ordering::SeqCst);
    }

    /// Delay each connect attempt by `ms` milliseconds.
    pub fn delay_connect_ms(&self, ms: u64) {
        self.connect_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Pretend a connection handle is already open (lingering handle).
    pub fn force_open_link(&self) {
        *locked(&self.link) = LinkState::Open;
    }

    /// Number of connect attempts observed.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of close calls observed.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// All text frames written so far, in order.
    pub fn sent_texts(&self) -> Vec<String> {
        locked(&self.texts).clone()
    }

    /// All binary frames written so far, in order.
    pub fn sent_binaries(&self) -> Vec<Vec<u8>> {
        locked(&self.binaries).clone()
    }

    /// Forget previously recorded frames.
    pub fn clear_sent(&self) {
        locked(&self.texts).clear();
        locked(&self.binaries).clear();
    }

    /// Inject an inbound event as if the peer produced it.
    pub fn inject(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        _config: &ConnectionConfig,
        _headers: &[(String, String)],
    ) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_connects.load(Ordering::SeqCst) {
            *locked(&self.link) = LinkState::Closed;
            return Err(DeviceError::Transport("connect refused".to_owned()));
        }
        *locked(&self.link) = LinkState::Open;
        if self.auto_handshake.load(Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Connected { status: 101 });
        }
        Ok(())
    }

    async fn write(&self, payload: &[u8], kind: FrameKind) -> Result<()> {
        if self.fail_writes_closed.load(Ordering::SeqCst) {
            *locked(&self.link) = LinkState::Closed;
            return Err(DeviceError::TransportClosed);
        }
        match kind {
            FrameKind::Text => {
                let text = String::from_utf8(payload.to_vec())
                    .map_err(|e| DeviceError::Transport(format!("non-UTF-8 text frame: {e}")))?;
                locked(&self.texts).push(text);
            }
            FrameKind::Binary => locked(&self.binaries).push(payload.to_vec()),
        }
        Ok(())
    }

    async fn close(&self, _reason: &str) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        *locked(&self.link) = LinkState::Closed;
        Ok(())
    }

    async fn reset(&self) {
        *locked(&self.link) = LinkState::Closed;
    }

    fn link_state(&self) -> LinkState {
        *locked(&self.link)
    }
}

/// Fake microphone/speaker/codec with call recording.
#[derive(Default)]
pub struct FakeAudio {
    mic: AtomicBool,
    speaker: AtomicBool,
    encoder_inits: AtomicUsize,
    downlinked: Mutex<Vec<Vec<u8>>>,
}

impl FakeAudio {
    /// How many times the encoder was initialized.
    pub fn encoder_init_count(&self) -> usize {
        self.encoder_inits.load(Ordering::SeqCst)
    }

    /// All downlink frames received, in order.
    pub fn downlinked(&self) -> Vec<Vec<u8>> {
        locked(&self.downlinked).clone()
    }
}

impl AudioHardware for FakeAudio {
    fn mic_enable(&self, enabled: bool) {
        self.mic.store(enabled, Ordering::SeqCst);
    }

    fn mic_is_enabled(&self) -> bool {
        self.mic.load(Ordering::SeqCst)
    }

    fn speaker_enable(&self, enabled: bool) {
        self.speaker.store(enabled, Ordering::SeqCst);
    }

    fn speaker_is_enabled(&self) -> bool {
        self.speaker.load(Ordering::SeqCst)
    }

    fn encoder_init(&self, _full_duplex: bool) {
        self.encoder_inits.fetch_add(1, Ordering::SeqCst);
    }

    fn downlink(&self, frame: &[u8]) {
        locked(&self.downlinked).push(frame.to_vec());
    }
}

/// Fake wake-word detector with call counters.
#[derive(Default)]
pub struct FakeWakeWord {
    enabled: AtomicBool,
    inits: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    fail_start: AtomicBool,
}

impl FakeWakeWord {
    /// Force the enabled flag without going through start/stop.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// When set, `start` fails.
    pub fn fail_start(&self, on: bool) {
        self.fail_start.store(on, Ordering::SeqCst);
    }

    /// How many times `init` was called.
    pub fn init_count(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    /// How many times `start` was called.
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// How many times `stop` was called.
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl WakeWordDetector for FakeWakeWord {
    fn init(&self) -> Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn deinit(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(DeviceError::Hardware("wake word start failed".to_owned()));
        }
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Fake IoT registry returning canned documents.
pub struct FakeIot {
    inits: AtomicUsize,
    states: Mutex<Option<String>>,
    descriptors: Mutex<Option<String>>,
    invoked: Mutex<Vec<Vec<u8>>>,
}

impl Default for FakeIot {
    fn default() -> Self {
        Self {
            inits: AtomicUsize::new(0),
            states: Mutex::new(Some(
                r#"[{"name":"Screen","state":{"brightness":80}}]"#.to_owned(),
            )),
            descriptors: Mutex::new(Some(r#"[{"name":"Screen"}]"#.to_owned())),
            invoked: Mutex::new(Vec::new()),
        }
    }
}

impl FakeIot {
    /// How many times `init` was called.
    pub fn init_count(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    /// Replace the canned states document (`None` simulates a read failure).
    pub fn set_states(&self, states: Option<String>) {
        *locked(&self.states) = states;
    }

    /// All commands invoked so far, in order.
    pub fn invoked(&self) -> Vec<Vec<u8>> {
        locked(&self.invoked).clone()
    }
}

impl IotSubsystem for FakeIot {
    fn init(&self) {
        self.inits.fetch_add(1, Ordering::SeqCst);
    }

    fn states_json(&self) -> Option<String> {
        locked(&self.states).clone()
    }

    fn descriptors_json(&self) -> Option<String> {
        locked(&self.descriptors).clone()
    }

    fn invoke(&self, command: &[u8]) {
        locked(&self.invoked).push(command.to_vec());
    }
}

/// Fake display recording everything it was told to show.
#[derive(Default)]
pub struct FakeDisplay {
    statuses: Mutex<Vec<String>>,
    outputs: Mutex<Vec<String>>,
    emojis: Mutex<Vec<String>>,
}

impl FakeDisplay {
    /// Most recent status line, if any.
    pub fn last_status(&self) -> Option<String> {
        locked(&self.statuses).last().cloned()
    }

    /// Most recent output text, if any.
    pub fn last_output(&self) -> Option<String> {
        locked(&self.outputs).last().cloned()
    }

    /// Most recent emoji tag, if any.
    pub fn last_emoji(&self) -> Option<String> {
        locked(&self.emojis).last().cloned()
    }
}

impl Display for FakeDisplay {
    fn set_status(&self, status: &str) {
        locked(&self.statuses).push(status.to_owned());
    }

    fn set_output(&self, text: &str) {
        locked(&self.outputs).push(text.to_owned());
    }

    fn set_emoji(&self, emoji: &str) {
        locked(&self.emojis).push(emoji.to_owned());
    }
}

/// Fake MCP handler recording payloads.
#[derive(Default)]
pub struct FakeMcp {
    payloads: Mutex<Vec<String>>,
}

impl FakeMcp {
    /// All payloads parsed so far, in order.
    pub fn payloads(&self) -> Vec<String> {
        locked(&self.payloads).clone()
    }
}

impl McpHandler for FakeMcp {
    fn parse(&self, payload: &str) {
        locked(&self.payloads).push(payload.to_owned());
    }
}

/// A fully wired session core over fakes, with the transport event pump
/// running.
pub struct TestRig {
    /// Shared application context.
    pub ctx: Arc<AppContext>,
    /// Connection manager under test.
    pub conn: Arc<ConnectionManager>,
    /// Inbound message dispatcher under test.
    pub dispatcher: Arc<MessageDispatcher>,
    /// Scriptable transport.
    pub transport: Arc<FakeTransport>,
    /// Fake audio hardware.
    pub audio: Arc<FakeAudio>,
    /// Fake wake-word detector (starts enabled).
    pub wakeword: Arc<FakeWakeWord>,
    /// Fake IoT registry.
    pub iot: Arc<FakeIot>,
    /// Fake display.
    pub display: Arc<FakeDisplay>,
    /// Fake MCP handler.
    pub mcp: Arc<FakeMcp>,
    /// Active configuration.
    pub config: Arc<DeviceConfig>,
}

/// Build a rig with the default configuration. Must run inside a tokio
/// runtime: the transport event pump is spawned here.
#[must_use]
pub fn test_rig() -> TestRig {
    test_rig_with(|_| {})
}

/// Build a rig after letting `adjust` tune the configuration.
#[must_use]
pub fn test_rig_with(adjust: impl FnOnce(&mut DeviceConfig)) -> TestRig {
    let mut config = DeviceConfig::default();
    adjust(&mut config);
    let config = Arc::new(config);

    let ctx = Arc::new(AppContext::new("00:11:22:33:44:55".to_owned()));
    let audio = Arc::new(FakeAudio::default());
    let wakeword = Arc::new(FakeWakeWord::default());
    wakeword.set_enabled(true);
    let iot = Arc::new(FakeIot::default());
    let display = Arc::new(FakeDisplay::default());
    let mcp = Arc::new(FakeMcp::default());
    let peripherals = Arc::new(Peripherals {
        audio: Arc::clone(&audio) as Arc<dyn AudioHardware>,
        wakeword: Arc::clone(&wakeword) as Arc<dyn WakeWordDetector>,
        iot: Arc::clone(&iot) as Arc<dyn IotSubsystem>,
        display: Arc::clone(&display) as Arc<dyn Display>,
        mcp: Arc::clone(&mcp) as Arc<dyn McpHandler>,
    });

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(FakeTransport::new(events_tx));
    let conn = Arc::new(ConnectionManager::new(
        Arc::clone(&ctx),
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::clone(&peripherals),
        Arc::clone(&config),
    ));
    let dispatcher = Arc::new(MessageDispatcher::new(
        Arc::clone(&ctx),
        Arc::clone(&conn),
        peripherals,
    ));
    conn.spawn_event_pump(Arc::clone(&dispatcher), events_rx);

    TestRig {
        ctx,
        conn,
        dispatcher,
        transport,
        audio,
        wakeword,
        iot,
        display,
        mcp,
        config,
    }
}
