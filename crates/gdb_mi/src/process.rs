use crate::record::{Record, Stream};
use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use smol::{
    channel,
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    Task,
};
use std::{collections::VecDeque, process::Stdio, sync::Arc, time::Duration};
use thiserror::Error;
use util::TryFutureExt;

const EXIT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ReadError {
    /// Nothing arrived within the read timeout.
    #[error("timed out waiting for debugger output")]
    Timeout,
    /// The process is gone or its output could not be read.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// A running debugger speaking the machine interface.
#[async_trait]
pub trait DebuggerProcess: Send + Sync {
    /// Writes one command line. A trailing newline is added.
    async fn write(&self, input: &str) -> Result<()>;

    /// Waits up to `timeout` for output, then returns every record that is
    /// available. Never returns an empty batch.
    async fn read_responses(&self, timeout: Duration) -> Result<Vec<Record>, ReadError>;

    /// Resolves once `read_responses` would return without waiting, or once the
    /// output stream has closed.
    async fn readable(&self);

    /// Interrupts the debuggee, like Ctrl-C at the gdb prompt.
    fn interrupt(&self) -> Result<()>;

    async fn exit(&self) -> Result<()>;
}

pub trait Launcher: Send + Sync {
    fn launch(&self) -> Result<Arc<dyn DebuggerProcess>>;
}

/// Records produced by the output readers, buffered until someone asks.
pub(crate) struct RecordQueue {
    rx: channel::Receiver<Record>,
    pending: VecDeque<Record>,
}

impl RecordQueue {
    pub(crate) fn new(rx: channel::Receiver<Record>) -> Self {
        Self {
            rx,
            pending: VecDeque::new(),
        }
    }

    pub(crate) async fn read(&mut self, timeout: Duration) -> Result<Vec<Record>, ReadError> {
        if self.pending.is_empty() {
            let first = util::timeout(timeout, self.rx.recv()).await;
            match first {
                Err(_) => return Err(ReadError::Timeout),
                Ok(Err(_)) => return Err(anyhow!("debugger output closed").into()),
                Ok(Ok(record)) => self.pending.push_back(record),
            }
        }
        while let Ok(record) = self.rx.try_recv() {
            self.pending.push_back(record);
        }
        Ok(self.pending.drain(..).collect())
    }

    pub(crate) async fn readable(&mut self) {
        if self.pending.is_empty() {
            if let Ok(record) = self.rx.recv().await {
                self.pending.push_back(record);
            }
        }
    }
}

pub struct GdbLauncher {
    pub path: String,
    pub args: Vec<String>,
}

impl GdbLauncher {
    pub fn new(path: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            path: path.into(),
            args,
        }
    }
}

impl Launcher for GdbLauncher {
    fn launch(&self) -> Result<Arc<dyn DebuggerProcess>> {
        Ok(Arc::new(GdbProcess::spawn(&self.path, &self.args)?))
    }
}

pub struct GdbProcess {
    pid: u32,
    child: Mutex<Option<Child>>,
    stdin: smol::lock::Mutex<ChildStdin>,
    records: smol::lock::Mutex<RecordQueue>,
    _io_tasks: (Task<Option<()>>, Task<Option<()>>),
}

impl GdbProcess {
    pub fn spawn(path: &str, args: &[String]) -> Result<Self> {
        let mut child = Command::new(path)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {path:?}"))?;
        let pid = child.id();
        log::info!("started {path} {} (pid {pid})", args.join(" "));

        let stdin = child.stdin.take().context("debugger stdin unavailable")?;
        let stdout = child.stdout.take().context("debugger stdout unavailable")?;
        let stderr = child.stderr.take().context("debugger stderr unavailable")?;

        let (records_tx, records_rx) = channel::unbounded();
        let stdout_task = smol::spawn(Self::handle_stdout(stdout, records_tx.clone()).log_err());
        let stderr_task = smol::spawn(Self::handle_stderr(stderr, records_tx).log_err());

        Ok(Self {
            pid,
            child: Mutex::new(Some(child)),
            stdin: smol::lock::Mutex::new(stdin),
            records: smol::lock::Mutex::new(RecordQueue::new(records_rx)),
            _io_tasks: (stdout_task, stderr_task),
        })
    }

    async fn handle_stdout<Stdout>(
        stdout: Stdout,
        records_tx: channel::Sender<Record>,
    ) -> Result<()>
    where
        Stdout: AsyncRead + Unpin,
    {
        let mut stdout = BufReader::new(stdout);
        let mut buffer = String::new();
        loop {
            buffer.clear();
            if stdout.read_line(&mut buffer).await? == 0 {
                return Ok(());
            }
            let line = buffer.trim_end_matches(['\r', '\n']);
            log::trace!("gdb: {line}");
            let record = match Record::parse_line(line) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(error) => {
                    log::warn!("unparseable debugger output: {error}");
                    Record::output(line, Stream::Stdout)
                }
            };
            if records_tx.send(record).await.is_err() {
                return Ok(());
            }
        }
    }

    async fn handle_stderr<Stderr>(
        stderr: Stderr,
        records_tx: channel::Sender<Record>,
    ) -> Result<()>
    where
        Stderr: AsyncRead + Unpin,
    {
        let mut stderr = BufReader::new(stderr);
        let mut buffer = String::new();
        loop {
            buffer.clear();
            if stderr.read_line(&mut buffer).await? == 0 {
                return Ok(());
            }
            let line = buffer.trim_end_matches(['\r', '\n']);
            log::warn!("gdb stderr: {line}");
            if records_tx.send(Record::output(line, Stream::Stderr)).await.is_err() {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl DebuggerProcess for GdbProcess {
    async fn write(&self, input: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(input.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn read_responses(&self, timeout: Duration) -> Result<Vec<Record>, ReadError> {
        self.records.lock().await.read(timeout).await
    }

    async fn readable(&self) {
        self.records.lock().await.readable().await
    }

    #[cfg(unix)]
    fn interrupt(&self) -> Result<()> {
        use nix::{sys::signal, unistd::Pid};
        let pid = i32::try_from(self.pid).context("pid out of range")?;
        signal::kill(Pid::from_raw(pid), signal::Signal::SIGINT)
            .with_context(|| format!("failed to interrupt debugger {pid}"))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn interrupt(&self) -> Result<()> {
        Err(anyhow!("interrupting the debugger is not supported on this platform"))
    }

    async fn exit(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().take() else {
            return Ok(());
        };
        if let Err(error) = self.write("-gdb-exit").await {
            log::debug!("could not ask debugger to exit: {error:#}");
        }
        match util::timeout(EXIT_TIMEOUT, child.status()).await {
            Ok(status) => {
                let status = status?;
                log::info!("debugger {} exited with {status}", self.pid);
            }
            Err(_) => {
                log::warn!("debugger {} did not exit, killing it", self.pid);
                child.kill()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_record_queue_batches_available_records() {
        smol::block_on(async {
            let (tx, rx) = channel::unbounded();
            let mut queue = RecordQueue::new(rx);

            assert!(matches!(
                queue.read(Duration::from_millis(10)).await,
                Err(ReadError::Timeout)
            ));

            tx.send(Record::result("done", None)).await.unwrap();
            tx.send(Record::output("hello", Stream::Stdout)).await.unwrap();
            let records = queue.read(Duration::from_millis(10)).await.unwrap();
            assert_eq!(
                records,
                vec![
                    Record::result("done", None),
                    Record::output("hello", Stream::Stdout)
                ]
            );

            tx.send(Record::output("late", Stream::Stderr)).await.unwrap();
            queue.readable().await;
            drop(tx);
            assert_eq!(
                queue.read(Duration::from_millis(10)).await.unwrap(),
                vec![Record::output("late", Stream::Stderr)]
            );
            assert!(matches!(
                queue.read(Duration::from_millis(10)).await,
                Err(ReadError::Failed(_))
            ));
        });
    }

    #[test]
    fn test_missing_binary_fails_to_launch() {
        let launcher = GdbLauncher::new("/nonexistent/gdb-binary", Vec::new());
        assert!(launcher.launch().is_err());
    }
}
