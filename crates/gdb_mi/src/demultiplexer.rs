use crate::{
    process::{DebuggerProcess, Launcher, ReadError},
    record::{Record, RecordKind},
    result_slot::ResultSlot,
};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use smol::Task;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc, Weak,
    },
    time::{Duration, Instant},
};
use util::ResultExt;

/// How debugger output gets pulled off the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheduling {
    /// A background task polls continuously and fills the result slot.
    Worker {
        poll_timeout: Duration,
        /// Consecutive empty polls after which the pump gives up.
        watchdog_limit: usize,
    },
    /// The owner calls `poke` whenever `readable` resolves.
    Reactor { poke_timeout: Duration },
}

struct Running {
    process: Arc<dyn DebuggerProcess>,
    ready: Arc<AtomicBool>,
    pump: Option<Task<()>>,
}

/// Owns the debugger process and routes its responses. Result records go to
/// a [`ResultSlot`] for whichever command is waiting; everything else is
/// logged.
pub struct Demultiplexer {
    launcher: Arc<dyn Launcher>,
    scheduling: Scheduling,
    running: Mutex<Option<Running>>,
    results: ResultSlot,
}

impl Demultiplexer {
    pub fn new(launcher: Arc<dyn Launcher>, scheduling: Scheduling) -> Arc<Self> {
        Arc::new(Self {
            launcher,
            scheduling,
            running: Mutex::new(None),
            results: ResultSlot::new(),
        })
    }

    pub fn scheduling(&self) -> Scheduling {
        self.scheduling
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn results(&self) -> &ResultSlot {
        &self.results
    }

    fn current(&self) -> Option<(Arc<dyn DebuggerProcess>, Arc<AtomicBool>)> {
        self.running
            .lock()
            .as_ref()
            .map(|running| (running.process.clone(), running.ready.clone()))
    }

    /// Launches the debugger unless it is already running. Returns whether a
    /// process was started.
    pub fn start(self: &Arc<Self>) -> Result<bool> {
        let mut running = self.running.lock();
        if running.is_some() {
            log::debug!("debugger already running");
            return Ok(false);
        }

        let process = self.launcher.launch()?;
        self.results.clear();
        let ready = Arc::new(AtomicBool::new(true));
        let pump = match self.scheduling {
            Scheduling::Worker {
                poll_timeout,
                watchdog_limit,
            } => Some(smol::spawn(Self::pump(
                Arc::downgrade(self),
                process.clone(),
                ready.clone(),
                poll_timeout,
                watchdog_limit,
            ))),
            Scheduling::Reactor { .. } => None,
        };
        log::info!("debugger started ({:?})", self.scheduling);
        *running = Some(Running {
            process,
            ready,
            pump,
        });
        Ok(true)
    }

    /// Stops the debugger if it is running. Returns whether there was anything
    /// to stop.
    pub async fn stop(&self) -> bool {
        let running = self.running.lock().take();
        let Some(Running {
            process,
            ready,
            pump,
        }) = running
        else {
            return false;
        };
        ready.store(false, SeqCst);
        drop(pump);
        process.interrupt().log_err();
        process.exit().await.log_err();
        self.results.clear();
        log::info!("debugger stopped");
        true
    }

    pub fn interrupt(&self) -> Result<()> {
        let (process, _) = self
            .current()
            .ok_or_else(|| anyhow!("debugger is not running"))?;
        process.interrupt()
    }

    /// Writes a raw line to the debugger. No result is awaited.
    pub async fn write(&self, input: &str) -> Result<()> {
        let (process, _) = self
            .current()
            .ok_or_else(|| anyhow!("debugger is not running"))?;
        log::debug!("write: {input}");
        process.write(input).await
    }

    /// Reads whatever output is available, waiting at most the configured
    /// poke timeout, and routes it. Returns the number of records routed.
    pub async fn poke(&self) -> Result<usize> {
        let timeout = match self.scheduling {
            Scheduling::Worker { poll_timeout, .. } => poll_timeout,
            Scheduling::Reactor { poke_timeout } => poke_timeout,
        };
        self.poke_for(timeout).await
    }

    pub async fn poke_for(&self, timeout: Duration) -> Result<usize> {
        let Some((process, ready)) = self.current() else {
            return Ok(0);
        };
        match process.read_responses(timeout).await {
            Ok(records) => {
                let count = records.len();
                for record in records {
                    self.dispatch(record);
                }
                Ok(count)
            }
            Err(ReadError::Timeout) => Ok(0),
            Err(ReadError::Failed(error)) => {
                log::error!("failed to read debugger output: {error:#}");
                self.release_if_current(&ready).await;
                Err(error)
            }
        }
    }

    /// Resolves once the debugger has output to route. Never resolves while no
    /// debugger is running.
    pub async fn readable(&self) {
        match self.current() {
            Some((process, _)) => process.readable().await,
            None => futures::future::pending::<()>().await,
        }
    }

    /// Waits up to `timeout` for the next result record.
    pub async fn wait_for_result(&self, timeout: Duration) -> Option<Record> {
        match self.scheduling {
            Scheduling::Worker { .. } => util::timeout(timeout, self.results.take())
                .await
                .ok()
                .flatten(),
            Scheduling::Reactor { poke_timeout } => {
                // Nothing else fills the slot in this mode, so read inline.
                let deadline = Instant::now() + timeout;
                loop {
                    if let Some(record) = self.results.try_take() {
                        return Some(record);
                    }
                    let now = Instant::now();
                    if now >= deadline || !self.is_running() {
                        return None;
                    }
                    if self.poke_for(poke_timeout.min(deadline - now)).await.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    fn dispatch(&self, record: Record) {
        match record.kind {
            RecordKind::Result => {
                log::debug!("result: {:?} {:?}", record.message, record.payload);
                self.results.put(record);
            }
            kind => log::debug!("{kind}: {:?} {:?}", record.message, record.payload),
        }
    }

    async fn pump(
        this: Weak<Self>,
        process: Arc<dyn DebuggerProcess>,
        ready: Arc<AtomicBool>,
        poll_timeout: Duration,
        watchdog_limit: usize,
    ) {
        let mut empty_polls = 0;
        while ready.load(SeqCst) {
            match process.read_responses(poll_timeout).await {
                Ok(records) => {
                    empty_polls = 0;
                    let Some(this) = this.upgrade() else {
                        break;
                    };
                    for record in records {
                        this.dispatch(record);
                    }
                }
                Err(ReadError::Timeout) => {
                    empty_polls += 1;
                    if empty_polls > watchdog_limit {
                        log::error!("no debugger output after {empty_polls} polls, giving up");
                        break;
                    }
                }
                Err(ReadError::Failed(error)) => {
                    if ready.load(SeqCst) {
                        log::error!("failed to read debugger output: {error:#}");
                    }
                    break;
                }
            }
        }

        if ready.load(SeqCst) {
            if let Some(this) = this.upgrade() {
                this.release_if_current(&ready).await;
            }
        }
    }

    /// Tears down the process identified by `ready` unless it has already been
    /// replaced or stopped.
    async fn release_if_current(&self, ready: &Arc<AtomicBool>) {
        let released = {
            let mut running = self.running.lock();
            match running.as_ref() {
                Some(current) if Arc::ptr_eq(&current.ready, ready) => running.take(),
                _ => None,
            }
        };
        let Some(Running { process, pump, .. }) = released else {
            return;
        };
        ready.store(false, SeqCst);
        // This may run on the pump itself, which must not cancel itself.
        if let Some(pump) = pump {
            pump.detach();
        }
        process.exit().await.log_err();
        log::info!("debugger released");
    }
}
