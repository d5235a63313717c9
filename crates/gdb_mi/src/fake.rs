use crate::{
    process::{DebuggerProcess, Launcher, ReadError, RecordQueue},
    record::Record,
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use smol::channel;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
        Arc,
    },
    time::Duration,
};

type Responder = Arc<dyn Fn(&str) -> Vec<FakeReply> + Send + Sync>;

/// A record the fake debugger emits in response to a command.
#[derive(Clone, Debug)]
pub struct FakeReply {
    pub delay: Duration,
    pub record: Record,
}

impl FakeReply {
    pub fn now(record: Record) -> Self {
        Self {
            delay: Duration::ZERO,
            record,
        }
    }

    pub fn after(delay: Duration, record: Record) -> Self {
        Self { delay, record }
    }
}

/// An in-memory debugger whose responses are scripted by a responder closure.
pub struct FakeProcess {
    tx: channel::Sender<Record>,
    records: smol::lock::Mutex<RecordQueue>,
    responder: Responder,
    written: Mutex<Vec<String>>,
    interrupts: AtomicUsize,
    exited: AtomicBool,
    fail_reads: AtomicBool,
}

impl FakeProcess {
    fn new(responder: Responder) -> Arc<Self> {
        let (tx, rx) = channel::unbounded();
        Arc::new(Self {
            tx,
            records: smol::lock::Mutex::new(RecordQueue::new(rx)),
            responder,
            written: Default::default(),
            interrupts: AtomicUsize::new(0),
            exited: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        })
    }

    /// Emits a record as if the debugger printed it spontaneously.
    pub fn emit(&self, record: Record) {
        self.tx.try_send(record).ok();
    }

    pub fn written(&self) -> Vec<String> {
        self.written.lock().clone()
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(SeqCst)
    }

    /// Makes every subsequent read fail, as if the process crashed.
    pub fn fail_reads(&self) {
        self.fail_reads.store(true, SeqCst);
    }
}

#[async_trait]
impl DebuggerProcess for FakeProcess {
    async fn write(&self, input: &str) -> Result<()> {
        if self.has_exited() {
            bail!("debugger has exited");
        }
        self.written.lock().push(input.to_string());
        for reply in (self.responder)(input) {
            if reply.delay.is_zero() {
                self.emit(reply.record);
            } else {
                let tx = self.tx.clone();
                smol::spawn(async move {
                    smol::Timer::after(reply.delay).await;
                    tx.send(reply.record).await.ok();
                })
                .detach();
            }
        }
        Ok(())
    }

    async fn read_responses(&self, timeout: Duration) -> Result<Vec<Record>, ReadError> {
        if self.fail_reads.load(SeqCst) {
            return Err(anyhow!("simulated read failure").into());
        }
        self.records.lock().await.read(timeout).await
    }

    async fn readable(&self) {
        if self.fail_reads.load(SeqCst) {
            return;
        }
        self.records.lock().await.readable().await
    }

    fn interrupt(&self) -> Result<()> {
        self.interrupts.fetch_add(1, SeqCst);
        Ok(())
    }

    async fn exit(&self) -> Result<()> {
        self.exited.store(true, SeqCst);
        Ok(())
    }
}

pub struct FakeLauncher {
    responder: Responder,
    processes: Mutex<Vec<Arc<FakeProcess>>>,
    fail_launches: AtomicBool,
}

impl FakeLauncher {
    pub fn new(responder: impl Fn(&str) -> Vec<FakeReply> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            responder: Arc::new(responder),
            processes: Default::default(),
            fail_launches: AtomicBool::new(false),
        })
    }

    /// A debugger that answers every command with a bare `^done`.
    pub fn answering_done() -> Arc<Self> {
        Self::new(|_| vec![FakeReply::now(Record::result("done", None))])
    }

    pub fn last(&self) -> Option<Arc<FakeProcess>> {
        self.processes.lock().last().cloned()
    }

    pub fn launch_count(&self) -> usize {
        self.processes.lock().len()
    }

    pub fn fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, SeqCst);
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self) -> Result<Arc<dyn DebuggerProcess>> {
        if self.fail_launches.load(SeqCst) {
            bail!("simulated launch failure");
        }
        let process = FakeProcess::new(self.responder.clone());
        self.processes.lock().push(process.clone());
        Ok(process)
    }
}
