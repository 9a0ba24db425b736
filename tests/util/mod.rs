use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use kopl::config::ShellCredentials;
use kopl::device::bootstrap::{BootstrapError, SessionConnector, ShellSession};
use kopl::device::control::{ControlError, ControlTransport};
use kopl::sync::RemoteFs;
use tempfile::TempDir;

/// Ordered record of everything the fakes saw, shared between them.
pub type EventLog = Rc<RefCell<Vec<String>>>;

#[allow(dead_code)]
pub fn event_log() -> EventLog {
    Rc::new(RefCell::new(Vec::new()))
}

/// Scripted control channel.
///
/// Exact-path replies are looked up first; REPL submissions pop from a queue.
/// Unknown paths answer with an empty body.
#[allow(dead_code)]
pub struct FakeDevice {
    pub log: EventLog,
    replies: HashMap<String, String>,
    repl_replies: RefCell<VecDeque<String>>,
    failing: HashSet<String>,
}

#[allow(dead_code)]
impl FakeDevice {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            replies: HashMap::new(),
            repl_replies: RefCell::new(VecDeque::new()),
            failing: HashSet::new(),
        }
    }

    /// A device whose SSH daemon comes up on `port` with the given flag.
    pub fn with_ssh(log: EventLog, port: &str, passwordless: &str) -> Self {
        Self::new(log)
            .reply("ui/SSH/SSH_port", port)
            .reply("ui/SSH/allow_no_password", passwordless)
    }

    pub fn reply(mut self, path: &str, body: &str) -> Self {
        self.replies.insert(path.to_string(), body.to_string());
        self
    }

    pub fn repl_reply(self, body: &str) -> Self {
        self.repl_replies.borrow_mut().push_back(body.to_string());
        self
    }

    /// Answer `path` with HTTP 500.
    pub fn failing(mut self, path: &str) -> Self {
        self.failing.insert(path.to_string());
        self
    }

    /// Paths requested so far, without the events of other fakes.
    pub fn requests(&self) -> Vec<String> {
        self.log
            .borrow()
            .iter()
            .filter_map(|event| event.strip_prefix("GET "))
            .map(str::to_string)
            .collect()
    }
}

impl ControlTransport for FakeDevice {
    fn get(&self, path: &str) -> Result<Vec<u8>, ControlError> {
        self.log.borrow_mut().push(format!("GET {path}"));
        if self.failing.contains(path) {
            return Err(ControlError::Status {
                url: path.to_string(),
                status: 500,
            });
        }
        if let Some(body) = self.replies.get(path) {
            return Ok(body.clone().into_bytes());
        }
        if path.starts_with("ui/Repl/repl/")
            && let Some(body) = self.repl_replies.borrow_mut().pop_front()
        {
            return Ok(body.into_bytes());
        }
        Ok(Vec::new())
    }
}

#[derive(Default)]
pub struct MemoryState {
    pub dirs: BTreeSet<String>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub modes: BTreeMap<String, u32>,
}

/// In-memory [`RemoteFs`]; clones share the same state.
#[derive(Clone)]
#[allow(dead_code)]
pub struct MemoryFs {
    pub state: Rc<RefCell<MemoryState>>,
    log: EventLog,
    fail_chmod: Rc<HashSet<String>>,
    fail_create: Rc<HashSet<String>>,
}

#[allow(dead_code)]
impl MemoryFs {
    pub fn new(log: EventLog) -> Self {
        Self {
            state: Rc::new(RefCell::new(MemoryState::default())),
            log,
            fail_chmod: Rc::new(HashSet::new()),
            fail_create: Rc::new(HashSet::new()),
        }
    }

    pub fn failing_chmod(mut self, remote_path: &str) -> Self {
        Rc::make_mut(&mut self.fail_chmod).insert(remote_path.to_string());
        self
    }

    pub fn failing_create(mut self, remote_path: &str) -> Self {
        Rc::make_mut(&mut self.fail_create).insert(remote_path.to_string());
        self
    }

    pub fn file(&self, remote_path: &str) -> Option<String> {
        self.state
            .borrow()
            .files
            .get(remote_path)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.state.borrow().files.keys().cloned().collect()
    }

    pub fn mode(&self, remote_path: &str) -> Option<u32> {
        self.state.borrow().modes.get(remote_path).copied()
    }
}

pub struct MemoryFile {
    path: String,
    state: Rc<RefCell<MemoryState>>,
}

impl io::Write for MemoryFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state
            .borrow_mut()
            .files
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl RemoteFs for MemoryFs {
    type File = MemoryFile;

    fn mkdir_all(&self, path: &str) -> io::Result<()> {
        self.log.borrow_mut().push(format!("mkdir {path}"));
        self.state.borrow_mut().dirs.insert(path.to_string());
        Ok(())
    }

    fn create(&self, path: &str) -> io::Result<MemoryFile> {
        self.log.borrow_mut().push(format!("create {path}"));
        if self.fail_create.contains(path) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"));
        }
        self.state
            .borrow_mut()
            .files
            .insert(path.to_string(), Vec::new());
        Ok(MemoryFile {
            path: path.to_string(),
            state: Rc::clone(&self.state),
        })
    }

    fn chmod(&self, path: &str, mode: u32) -> io::Result<()> {
        if self.fail_chmod.contains(path) {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "setstat unsupported"));
        }
        self.state.borrow_mut().modes.insert(path.to_string(), mode);
        Ok(())
    }
}

/// Connector handing out sessions over a shared [`MemoryFs`].
#[allow(dead_code)]
pub struct FakeConnector {
    pub fs: MemoryFs,
    log: EventLog,
    reject: bool,
}

#[allow(dead_code)]
impl FakeConnector {
    pub fn new(log: EventLog, fs: MemoryFs) -> Self {
        Self {
            fs,
            log,
            reject: false,
        }
    }

    pub fn rejecting(mut self) -> Self {
        self.reject = true;
        self
    }
}

impl SessionConnector for FakeConnector {
    type Session = FakeSession;

    fn connect(
        &self,
        host: &str,
        port: u16,
        creds: &ShellCredentials,
    ) -> Result<FakeSession, BootstrapError> {
        self.log
            .borrow_mut()
            .push(format!("ssh connect {}@{host}:{port}", creds.user));
        if self.reject {
            return Err(BootstrapError::AuthFailed {
                user: creds.user.clone(),
                attempts: 1 + creds.identities.len(),
            });
        }
        Ok(FakeSession {
            fs: self.fs.clone(),
            log: Rc::clone(&self.log),
        })
    }
}

pub struct FakeSession {
    fs: MemoryFs,
    log: EventLog,
}

impl ShellSession for FakeSession {
    type Fs = MemoryFs;

    fn filesystem(&self) -> Result<MemoryFs, BootstrapError> {
        Ok(self.fs.clone())
    }

    fn close(self) {
        self.log.borrow_mut().push("ssh close".to_string());
    }
}

/// A small plugin project, including entries that must never be uploaded.
#[allow(dead_code)]
pub struct PluginFixture {
    pub dir: TempDir,
    pub root: PathBuf,
}

#[allow(dead_code)]
impl PluginFixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path().join("hello.koplugin");
        write(&root.join("_meta.lua"), "return { name = \"hello\" }\n");
        write(&root.join("main.lua"), "local M = {}\nreturn M\n");
        write(&root.join("lib/strings.lua"), "return {}\n");
        write(&root.join(".git/HEAD"), "ref: refs/heads/main\n");
        write(&root.join(".luarc.json"), "{}\n");
        write(&root.join("koreader/frontend/ui.lua"), "-- vendored\n");
        Self { dir, root }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}

#[allow(dead_code)]
pub fn write(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create fixture dir");
    }
    std::fs::write(path, contents).expect("write fixture file");
}

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[allow(dead_code)]
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, val.as_ref()) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}
