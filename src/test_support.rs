//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error_handling::types::{SandboxError, StorageError};
use crate::sandbox::provider::{
    CommandOutput, CreateOptions, FileEvent, PtyOptions, PtyProcess, Sandbox, SandboxProvider,
};
use crate::storage::storage_trait::Storage;
use crate::storage::types::{
    ActivityEvent, Challenge, EventType, NewEvent, Session, SessionStatus,
};

/// Bytes a fake shell emits when its window size changes.
pub(crate) const RESIZE_NOISE: &[u8] = b"\r\x1b[K$ \r\x1b[K$ ";
/// Bytes a fake shell emits after a clear-screen.
pub(crate) const CLEAN_PROMPT: &[u8] = b"\x1b[H\x1b[2J$ ";

#[derive(Default)]
pub(crate) struct MemStorage {
    sessions: Mutex<HashMap<Uuid, Session>>,
    events: Mutex<Vec<ActivityEvent>>,
    challenges: Mutex<HashMap<Uuid, Challenge>>,
    pub fail_event_writes: AtomicBool,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_of(&self, session_id: Uuid) -> Vec<ActivityEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn events_of_type(&self, session_id: Uuid, event_type: EventType) -> Vec<ActivityEvent> {
        self.events_of(session_id)
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn session(&self, session_id: Uuid) -> Session {
        self.sessions.lock().unwrap()[&session_id].clone()
    }

    /// Stores a pending session backed by a challenge with `files`.
    pub fn seed_session(&self, files: &[(&str, &str)]) -> Uuid {
        let challenge = Challenge {
            id: Uuid::new_v4(),
            description: String::from("Make the tests pass"),
            generated_files: files
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        let session = Session::new(Some(challenge.id));
        let id = session.id;
        self.challenges.lock().unwrap().insert(challenge.id, challenge);
        self.sessions.lock().unwrap().insert(id, session);
        id
    }

    /// Stores an active session pointing at `sandbox_id`.
    pub fn seed_active_session(&self, files: &[(&str, &str)], sandbox_id: &str) -> Uuid {
        let id = self.seed_session(files);
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(&id).unwrap();
        session.status = SessionStatus::Active;
        session.sandbox_id = Some(sandbox_id.to_string());
        session.started_at = Some(Utc::now());
        id
    }

    pub fn set_status(&self, session_id: Uuid, status: SessionStatus) {
        self.sessions
            .lock()
            .unwrap()
            .get_mut(&session_id)
            .unwrap()
            .status = status;
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, StorageError> {
        Ok(self.sessions.lock().unwrap().get(&session_id).cloned())
    }

    async fn save_session(&self, session: &Session) -> Result<(), StorageError> {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn append_event(&self, event: NewEvent) -> Result<i64, StorageError> {
        if self.fail_event_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteFailed);
        }
        let mut events = self.events.lock().unwrap();
        let id = events.len() as i64 + 1;
        events.push(ActivityEvent {
            id,
            session_id: event.session_id,
            event_type: event.event_type,
            raw_content: event.raw_content,
            metadata: event.metadata,
            timestamp: Utc::now(),
        });
        Ok(id)
    }

    async fn get_events(&self, session_id: Uuid) -> Result<Vec<ActivityEvent>, StorageError> {
        Ok(self.events_of(session_id))
    }

    async fn save_challenge(&self, challenge: &Challenge) -> Result<(), StorageError> {
        self.challenges
            .lock()
            .unwrap()
            .insert(challenge.id, challenge.clone());
        Ok(())
    }

    async fn get_challenge(&self, challenge_id: Uuid) -> Result<Option<Challenge>, StorageError> {
        Ok(self.challenges.lock().unwrap().get(&challenge_id).cloned())
    }
}

type Script = Vec<(String, Result<CommandOutput, SandboxError>)>;

pub(crate) struct FakeSandbox {
    id: String,
    files: Mutex<BTreeMap<String, String>>,
    commands: Mutex<Vec<String>>,
    script: Mutex<Script>,
    pty_input: Mutex<Vec<Vec<u8>>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    stale_writes: AtomicUsize,
    pty_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    watch_tx: Mutex<Option<mpsc::Sender<FileEvent>>>,
    next_pid: AtomicU32,
    pub fail_reads: AtomicBool,
    pub fail_pty: AtomicBool,
    pub killed: AtomicBool,
}

impl FakeSandbox {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            files: Mutex::new(BTreeMap::new()),
            commands: Mutex::new(Vec::new()),
            script: Mutex::new(Vec::new()),
            pty_input: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            stale_writes: AtomicUsize::new(0),
            pty_tx: Mutex::new(None),
            watch_tx: Mutex::new(None),
            next_pid: AtomicU32::new(100),
            fail_reads: AtomicBool::new(false),
            fail_pty: AtomicBool::new(false),
            killed: AtomicBool::new(false),
        }
    }

    /// The first scripted entry whose pattern occurs in a command answers it.
    pub fn respond_to(&self, pattern: &str, result: Result<CommandOutput, SandboxError>) {
        self.script
            .lock()
            .unwrap()
            .push((pattern.to_string(), result));
    }

    pub fn put_file(&self, path: &str, content: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
    }

    pub fn files(&self) -> BTreeMap<String, String> {
        self.files.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn pty_input(&self) -> Vec<Vec<u8>> {
        self.pty_input.lock().unwrap().clone()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }

    /// The next `n` PTY writes or resizes fail as if the process were gone.
    pub fn fail_next_pty_writes(&self, n: usize) {
        self.stale_writes.store(n, Ordering::SeqCst);
    }

    pub async fn emit_output(&self, chunk: &[u8]) {
        let tx = self.pty_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(Bytes::copy_from_slice(chunk)).await;
        }
    }

    pub async fn emit_file_event(&self, kind: &str, name: &str) {
        let tx = self.watch_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx
                .send(FileEvent {
                    kind: kind.to_string(),
                    name: name.to_string(),
                })
                .await;
        }
    }

    /// Ends the PTY output stream, as when the remote process dies.
    pub fn close_pty(&self) {
        self.pty_tx.lock().unwrap().take();
    }

    fn take_stale_write(&self) -> bool {
        self.stale_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn echo(&self, chunk: &[u8]) {
        if let Some(tx) = self.pty_tx.lock().unwrap().as_ref() {
            let _ = tx.try_send(Bytes::copy_from_slice(chunk));
        }
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn sandbox_id(&self) -> &str {
        &self.id
    }

    async fn run_command(
        &self,
        cmd: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, SandboxError> {
        self.commands.lock().unwrap().push(cmd.to_string());
        let script = self.script.lock().unwrap();
        match script.iter().find(|(pattern, _)| cmd.contains(pattern.as_str())) {
            Some((_, result)) => result.clone(),
            None => Ok(CommandOutput::default()),
        }
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SandboxError::Transport(String::from("connection reset")));
        }
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(path.to_string()))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.put_file(path, content);
        Ok(())
    }

    async fn watch_dir(&self, _path: &str) -> Result<mpsc::Receiver<FileEvent>, SandboxError> {
        let (tx, rx) = mpsc::channel(64);
        *self.watch_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn create_pty(&self, _options: PtyOptions<'_>) -> Result<PtyProcess, SandboxError> {
        if self.fail_pty.load(Ordering::SeqCst) {
            return Err(SandboxError::Transport(String::from("pty refused")));
        }
        let (tx, rx) = mpsc::channel(64);
        *self.pty_tx.lock().unwrap() = Some(tx);
        Ok(PtyProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            output: rx,
        })
    }

    async fn send_pty_input(&self, pid: u32, data: &[u8]) -> Result<(), SandboxError> {
        if self.take_stale_write() {
            return Err(SandboxError::PtyGone(format!("pty {}", pid)));
        }
        self.pty_input.lock().unwrap().push(data.to_vec());
        if data == b"\x0c" {
            self.echo(CLEAN_PROMPT);
        }
        Ok(())
    }

    async fn resize_pty(&self, pid: u32, cols: u16, rows: u16) -> Result<(), SandboxError> {
        if self.take_stale_write() {
            return Err(SandboxError::PtyGone(format!("pty {}", pid)));
        }
        self.resizes.lock().unwrap().push((cols, rows));
        self.echo(RESIZE_NOISE);
        Ok(())
    }

    async fn kill(&self) -> Result<(), SandboxError> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeProvider {
    sandboxes: Mutex<HashMap<String, Arc<FakeSandbox>>>,
    created: Mutex<Vec<Arc<FakeSandbox>>>,
    created_envs: Mutex<Vec<HashMap<String, String>>>,
    create_script: Mutex<Script>,
    pub connects: AtomicUsize,
    pub creates: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub fail_pty_on_create: AtomicBool,
    connect_delay: Mutex<Duration>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an already running sandbox reachable through `connect`.
    pub fn add_sandbox(&self, id: &str) -> Arc<FakeSandbox> {
        let sandbox = Arc::new(FakeSandbox::new(id));
        self.sandboxes
            .lock()
            .unwrap()
            .insert(id.to_string(), sandbox.clone());
        sandbox
    }

    pub fn sandbox(&self, id: &str) -> Option<Arc<FakeSandbox>> {
        self.sandboxes.lock().unwrap().get(id).cloned()
    }

    pub fn last_created(&self) -> Option<Arc<FakeSandbox>> {
        self.created.lock().unwrap().last().cloned()
    }

    pub fn created_envs(&self) -> Vec<HashMap<String, String>> {
        self.created_envs.lock().unwrap().clone()
    }

    /// Scripts a command response on every sandbox created afterwards.
    pub fn script_on_create(&self, pattern: &str, result: Result<CommandOutput, SandboxError>) {
        self.create_script
            .lock()
            .unwrap()
            .push((pattern.to_string(), result));
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    async fn create(&self, options: CreateOptions) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        let sandbox = self.add_sandbox(&format!("sbx-created-{}", n));
        for (pattern, result) in self.create_script.lock().unwrap().iter() {
            sandbox.respond_to(pattern, result.clone());
        }
        if self.fail_pty_on_create.load(Ordering::SeqCst) {
            sandbox.fail_pty.store(true, Ordering::SeqCst);
        }
        self.created_envs.lock().unwrap().push(options.envs);
        self.created.lock().unwrap().push(sandbox.clone());
        Ok(sandbox)
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(SandboxError::Transport(String::from("connection refused")));
        }
        match self.sandbox(sandbox_id) {
            Some(sandbox) => Ok(sandbox),
            None => Err(SandboxError::NotFound(sandbox_id.to_string())),
        }
    }
}
