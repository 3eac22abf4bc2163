//! Scripted connections for exercising the handshake and the pool without a
//! database server.
//!
//! A [`Script`] decides how each handshake primitive behaves. Every call is
//! recorded as an [`Event`] on the connection's [`Probe`], which stays with
//! the test after the connection has moved into a pool or task.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::connection::{Connect, Connection, PollingStatus, WaitFuture};
use crate::error::Error;
use crate::source::{ConnectionFactory, ConnectionInfo};

/// Observable call made on a [`ScriptedConnection`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Start(String),
    AssignSocket,
    WaitWrite,
    WaitRead,
    Poll(PollingStatus),
    SetExecutor,
    Close,
    Cancel,
}

/// Behaviour of one scripted connection.
///
/// The default script starts, assigns its socket, waits for write readiness
/// once and then polls `Ok`.
#[derive(Clone, Debug, Default)]
pub struct Script {
    start_fails: bool,
    bad_after_start: bool,
    assign_fails: bool,
    rebind_fails: bool,
    polls: VecDeque<PollingStatus>,
    wait_error: Option<io::ErrorKind>,
    stall: bool,
    error_message: String,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Poll results returned in order. `Ok` once exhausted.
    pub fn polls(mut self, polls: impl IntoIterator<Item = PollingStatus>) -> Self {
        self.polls = polls.into_iter().collect();
        self
    }

    pub fn start_fails(mut self) -> Self {
        self.start_fails = true;
        self
    }

    /// Native status reports bad right after a successful start.
    pub fn bad_after_start(mut self) -> Self {
        self.bad_after_start = true;
        self
    }

    pub fn assign_fails(mut self) -> Self {
        self.assign_fails = true;
        self
    }

    /// `set_executor` refuses to rebind.
    pub fn rebind_fails(mut self) -> Self {
        self.rebind_fails = true;
        self
    }

    /// Every readiness wait completes with an error of this kind.
    pub fn wait_fails(mut self, kind: io::ErrorKind) -> Self {
        self.wait_error = Some(kind);
        self
    }

    /// Readiness waits never complete.
    pub fn stall(mut self) -> Self {
        self.stall = true;
        self
    }

    /// Native error message reported by `error_message`.
    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }
}

/// Test-side view of a scripted connection.
#[derive(Clone, Debug)]
pub struct Probe {
    id: u64,
    events: Arc<Mutex<Vec<Event>>>,
    bad: Arc<AtomicBool>,
}

impl Probe {
    fn new(id: u64) -> Self {
        Self {
            id,
            events: Arc::new(Mutex::new(Vec::new())),
            bad: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Identifier of the connection, also used as its native handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Readiness waits requested so far, in order.
    pub fn waits(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::WaitWrite | Event::WaitRead))
            .collect()
    }

    /// Number of times `event` was recorded.
    pub fn count(&self, event: &Event) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    pub fn is_closed(&self) -> bool {
        self.count(&Event::Close) > 0
    }

    /// Make the connection report itself unhealthy.
    pub fn mark_bad(&self) {
        self.bad.store(true, Ordering::SeqCst);
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}

/// A [`Connect`] implementation that follows a [`Script`].
#[derive(Debug)]
pub struct ScriptedConnection {
    script: Script,
    native: Option<u64>,
    io: Handle,
    error_context: String,
    oid_map: HashMap<String, u32>,
    probe: Probe,
}

impl ScriptedConnection {
    pub fn new(io: Handle, script: Script, id: u64) -> Self {
        Self {
            script,
            native: None,
            io,
            error_context: String::new(),
            oid_map: HashMap::new(),
            probe: Probe::new(id),
        }
    }

    pub fn probe(&self) -> &Probe {
        &self.probe
    }

    pub fn id(&self) -> u64 {
        self.probe.id
    }

    fn wait(&mut self, event: Event) -> WaitFuture<'_> {
        self.probe.record(event);
        let stall = self.script.stall;
        let failure = self.script.wait_error;
        Box::pin(async move {
            if stall {
                std::future::pending::<()>().await;
            }
            tokio::task::yield_now().await;
            match failure {
                Some(kind) => Err(io::Error::new(kind, "scripted readiness failure")),
                None => Ok(()),
            }
        })
    }
}

impl Connection for ScriptedConnection {
    type Native = u64;
    type OidMap = HashMap<String, u32>;

    fn native_handle(&self) -> Option<&u64> {
        self.native.as_ref()
    }

    fn assign(&mut self, native: u64) -> Result<(), Error> {
        self.native = Some(native);
        Ok(())
    }

    fn oid_map(&self) -> &Self::OidMap {
        &self.oid_map
    }

    fn oid_map_mut(&mut self) -> &mut Self::OidMap {
        &mut self.oid_map
    }

    fn error_context(&self) -> &str {
        &self.error_context
    }

    fn set_error_context(&mut self, context: String) {
        self.error_context = context;
    }

    fn executor(&self) -> &Handle {
        &self.io
    }

    fn set_executor(&mut self, io: Handle) -> Result<(), Error> {
        self.probe.record(Event::SetExecutor);
        if self.script.rebind_fails {
            return Err(Error::Native("scripted rebind failure".into()));
        }
        self.io = io;
        Ok(())
    }

    fn wait_write(&mut self) -> WaitFuture<'_> {
        self.wait(Event::WaitWrite)
    }

    fn wait_read(&mut self) -> WaitFuture<'_> {
        self.wait(Event::WaitRead)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.probe.record(Event::Close);
        self.native = None;
        Ok(())
    }

    fn cancel(&mut self) {
        self.probe.record(Event::Cancel);
    }

    fn is_bad(&self) -> bool {
        self.native.is_none() || self.probe.bad.load(Ordering::SeqCst)
    }
}

impl Connect for ScriptedConnection {
    fn start_connection(&mut self, conninfo: &str) -> Result<(), Error> {
        self.probe.record(Event::Start(conninfo.to_string()));
        if self.script.start_fails {
            return Err(Error::Native("scripted start failure".into()));
        }
        self.native = Some(self.probe.id);
        if self.script.bad_after_start {
            self.probe.mark_bad();
        }
        Ok(())
    }

    fn assign_socket(&mut self) -> Result<(), Error> {
        self.probe.record(Event::AssignSocket);
        if self.script.assign_fails {
            return Err(Error::Io(io::Error::other("scripted socket assignment failure")));
        }
        Ok(())
    }

    fn connect_poll(&mut self) -> PollingStatus {
        let status = self.script.polls.pop_front().unwrap_or(PollingStatus::Ok);
        self.probe.record(Event::Poll(status));
        status
    }

    fn error_message(&self) -> String {
        self.script.error_message.clone()
    }
}

#[derive(Debug, Default)]
struct FactoryState {
    scripts: VecDeque<Script>,
    fallback: Script,
    probes: Vec<Probe>,
}

/// Hands out [`ScriptedConnection`]s and keeps their probes.
///
/// Queued scripts are used first, in order; after that every connection
/// follows the fallback script.
#[derive(Debug, Default)]
pub struct ScriptedFactory {
    state: Mutex<FactoryState>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(fallback: Script) -> Self {
        Self {
            state: Mutex::new(FactoryState {
                fallback,
                ..FactoryState::default()
            }),
        }
    }

    /// Queue a script for the next connection created.
    pub fn push(&self, script: Script) {
        self.state.lock().scripts.push_back(script);
    }

    /// Number of connections created so far.
    pub fn created(&self) -> usize {
        self.state.lock().probes.len()
    }

    pub fn probes(&self) -> Vec<Probe> {
        self.state.lock().probes.clone()
    }

    /// Probe of the `index`-th connection created.
    pub fn probe(&self, index: usize) -> Option<Probe> {
        self.state.lock().probes.get(index).cloned()
    }
}

impl ConnectionFactory for ScriptedFactory {
    type Connection = ScriptedConnection;

    fn create(&self, io: &Handle) -> ScriptedConnection {
        let mut state = self.state.lock();
        let script = match state.scripts.pop_front() {
            Some(script) => script,
            None => state.fallback.clone(),
        };
        let id = state.probes.len() as u64 + 1;
        let conn = ScriptedConnection::new(io.clone(), script, id);
        state.probes.push(conn.probe().clone());
        conn
    }
}

/// A connection source over a shared [`ScriptedFactory`].
pub fn scripted_source(factory: &Arc<ScriptedFactory>) -> ConnectionInfo<Arc<ScriptedFactory>> {
    ConnectionInfo::new("host=scripted dbname=test", Arc::clone(factory))
}
