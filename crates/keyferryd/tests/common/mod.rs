#![allow(dead_code)]

use keyferry::pairing::{self, Paired, Registration};
use keyferry::sender::{self, AgentReply, Sender};
use keyferry::{ClientError, Credentials};
use keyferry_proto::crypto::unix_now_ms;
use keyferry_proto::envelope::seal_message;
use keyferry_proto::types::MsgType;
use keyferry_proto::DeviceKey;
use keyferryd::capabilities::{
    Capabilities, CapabilityError, ClipboardSetter, FocusInspector, FocusTarget, Injector,
};
use keyferryd::clock::{Clock, ManualClock};
use keyferryd::config::AgentConfig;
use keyferryd::registry::{DeviceRecord, DeviceRegistry, SealedDeviceStore, StoreError};
use keyferryd::store::MemoryStore;
use keyferryd::{run_with_shutdown, AgentState};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const DEADLINE: Duration = Duration::from_secs(5);
pub const DEVICE_ID: &str = "phone";

#[derive(Default)]
pub struct RecordingInjector {
    pub injected: Mutex<Vec<Vec<u8>>>,
    delay: Mutex<Duration>,
}

impl RecordingInjector {
    pub fn count(&self) -> usize {
        self.injected.lock().unwrap().len()
    }

    /// Makes every later injection block for `delay` before recording.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

impl Injector for RecordingInjector {
    fn name(&self) -> &str {
        "recording"
    }

    fn inject(&self, secret: &[u8]) -> Result<(), CapabilityError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.injected.lock().unwrap().push(secret.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingClipboard {
    pub contents: Mutex<Vec<Vec<u8>>>,
}

impl ClipboardSetter for RecordingClipboard {
    fn set(&self, secret: &[u8]) -> Result<(), CapabilityError> {
        self.contents.lock().unwrap().push(secret.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct StaticFocus {
    pub target: Mutex<Option<FocusTarget>>,
}

impl StaticFocus {
    pub fn focus(&self, process: &str, title: &str) {
        *self.target.lock().unwrap() = Some(FocusTarget {
            process: process.to_string(),
            title: title.to_string(),
        });
    }
}

impl FocusInspector for StaticFocus {
    fn current_target(&self) -> Result<FocusTarget, CapabilityError> {
        self.target
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CapabilityError::Unavailable("no window focused".into()))
    }
}

/// Starts empty and refuses every write.
pub struct ReadOnlyStore;

impl SealedDeviceStore for ReadOnlyStore {
    fn load(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Err(StoreError::NotPaired)
    }

    fn save(&self, _: &[DeviceRecord]) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("read-only volume".into()))
    }
}

pub fn test_config() -> AgentConfig {
    AgentConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        max_conns: 32,
        rate_limit: 1_000,
        preamble_timeout: Duration::from_millis(300),
        ..AgentConfig::default()
    }
}

pub struct TestAgent {
    pub addr: SocketAddr,
    pub state: Arc<AgentState>,
    pub clock: Arc<ManualClock>,
    pub injector: Arc<RecordingInjector>,
    pub clipboard: Arc<RecordingClipboard>,
    pub focus: Arc<StaticFocus>,
    pub server: JoinHandle<Result<(), keyferryd::error::AgentError>>,
    pub shutdown: watch::Sender<()>,
}

impl TestAgent {
    /// Registers a device directly, bypassing pairing.
    pub fn add_device(&self, device_id: &str) -> Credentials {
        let key = DeviceKey::generate();
        self.state
            .registry
            .upsert(DeviceRecord {
                device_id: device_id.to_string(),
                key: key.clone(),
                created_at_ms: self.clock.now_ms(),
            })
            .unwrap();
        Credentials {
            agent: self.addr.to_string(),
            device_id: device_id.to_string(),
            key,
        }
    }

    pub fn issue_token(&self) -> String {
        let issued = self
            .state
            .pairing
            .issue(self.clock.now_ms(), self.state.config.pairing_ttl_ms);
        issued.token.to_string()
    }

    pub async fn sender(&self, credentials: Credentials) -> Sender<tokio::net::TcpStream> {
        Sender::connect(credentials, DEADLINE).await.unwrap()
    }

    pub async fn pair(&self, token: &str, registration: Registration) -> Result<Paired, ClientError> {
        let stream = sender::connect_pair(&self.addr.to_string(), DEADLINE).await?;
        pairing::pair(stream, token, registration, DEADLINE).await
    }
}

pub async fn start_agent(config: AgentConfig) -> TestAgent {
    start_agent_with(config, Arc::new(MemoryStore::new()), None).await
}

/// Starts an agent over `store`. When `injector` is given it replaces the
/// recording injector, which then stays empty.
pub async fn start_agent_with(
    config: AgentConfig,
    store: Arc<dyn SealedDeviceStore>,
    injector: Option<Arc<dyn Injector>>,
) -> TestAgent {
    let listener = TcpListener::bind(config.listen).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let registry = DeviceRegistry::load(store).unwrap();
    let recorder = Arc::new(RecordingInjector::default());
    let clipboard = Arc::new(RecordingClipboard::default());
    let focus = Arc::new(StaticFocus::default());
    let capabilities = Capabilities {
        injector: injector.unwrap_or_else(|| recorder.clone() as Arc<dyn Injector>),
        clipboard: Some(clipboard.clone()),
        focus: Some(focus.clone()),
    };
    let clock = Arc::new(ManualClock::new(unix_now_ms()));
    let state = Arc::new(AgentState::new(
        config,
        Arc::new(registry),
        capabilities,
        clock.clone(),
    ));

    let (shutdown, shutdown_rx) = watch::channel(());
    let server = tokio::spawn(run_with_shutdown(listener, state.clone(), shutdown_rx));

    TestAgent {
        addr,
        state,
        clock,
        injector: recorder,
        clipboard,
        focus,
        server,
        shutdown,
    }
}

/// Seals a frame stamped with the agent's current clock.
pub fn frame_at(creds: &Credentials, msg_type: MsgType, payload: &[u8], ts_ms: u64) -> Vec<u8> {
    seal_message(creds.key.as_bytes(), &creds.device_id, msg_type, payload, ts_ms).unwrap()
}

pub async fn send_at(
    sender: &mut Sender<tokio::net::TcpStream>,
    msg_type: MsgType,
    payload: &[u8],
    ts_ms: u64,
) -> AgentReply {
    let frame = frame_at(sender.credentials(), msg_type, payload, ts_ms);
    sender.send_raw(&frame).await.unwrap()
}

pub fn assert_reply(reply: &AgentReply, status: &str, reason: Option<&str>) {
    assert_eq!(reply.status, status, "unexpected reply {reply}");
    assert_eq!(reply.reason.as_deref(), reason, "unexpected reply {reply}");
}
