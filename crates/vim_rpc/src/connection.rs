use crate::{
    correlator::{Accepted, Correlator, CorrelatorState},
    message::{Envelope, Outbound, ProtocolError},
};
use anyhow::Result;
use serde_json::Value;
use smol::{
    channel,
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
    Task,
};
use util::TryFutureExt;

type IncomingResult = Result<Envelope, ProtocolError>;

/// One editor channel: newline-delimited JSON arrays in both directions.
///
/// Reading and writing happen on background tasks so that waiting for the
/// next message can be abandoned at any point without losing input.
pub struct Connection {
    outbound_tx: channel::Sender<String>,
    incoming_rx: channel::Receiver<IncomingResult>,
    correlator: Correlator,
    poisoned: Option<ProtocolError>,
    _io_tasks: Option<(Task<Option<()>>, Task<Option<()>>)>,
}

impl Connection {
    pub fn new<Reader, Writer>(reader: Reader, writer: Writer) -> Self
    where
        Reader: AsyncRead + Unpin + Send + 'static,
        Writer: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = channel::unbounded::<String>();
        let (incoming_tx, incoming_rx) = channel::unbounded::<IncomingResult>();
        let input_task = smol::spawn(Self::handle_input(reader, incoming_tx).log_err());
        let output_task = smol::spawn(Self::handle_output(writer, outbound_rx).log_err());

        let mut connection = Self::from_channels(outbound_tx, incoming_rx);
        connection._io_tasks = Some((input_task, output_task));
        connection
    }

    fn from_channels(
        outbound_tx: channel::Sender<String>,
        incoming_rx: channel::Receiver<IncomingResult>,
    ) -> Self {
        Self {
            outbound_tx,
            incoming_rx,
            correlator: Correlator::new(),
            poisoned: None,
            _io_tasks: None,
        }
    }

    async fn handle_input<Reader>(
        reader: Reader,
        incoming_tx: channel::Sender<IncomingResult>,
    ) -> Result<()>
    where
        Reader: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buffer = String::new();
        loop {
            buffer.clear();
            if reader.read_line(&mut buffer).await? == 0 {
                log::info!("editor closed its end of the channel");
                return Ok(());
            }
            if buffer.trim().is_empty() {
                continue;
            }
            log::debug!("read: {}", buffer.trim_end());
            if incoming_tx.send(Envelope::decode(&buffer)).await.is_err() {
                return Ok(());
            }
        }
    }

    async fn handle_output<Writer>(
        writer: Writer,
        outbound_rx: channel::Receiver<String>,
    ) -> Result<()>
    where
        Writer: AsyncWrite + Unpin,
    {
        let mut writer = BufWriter::new(writer);
        while let Ok(line) = outbound_rx.recv().await {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok(())
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Pushes a spontaneous message (`[0, payload]`) to the editor.
    pub fn send(&mut self, payload: Value) -> Result<(), ProtocolError> {
        self.write(Outbound::Notification(payload))
    }

    /// Calls an editor function and waits for its result.
    pub async fn call(&mut self, function: &str, args: Vec<Value>) -> Result<Value, ProtocolError> {
        let index = self.begin_call()?;
        self.write(Outbound::Call {
            function: function.to_string(),
            args,
            reply_index: Some(index),
        })?;
        self.await_reply().await
    }

    pub fn call_no_reply(&mut self, function: &str, args: Vec<Value>) -> Result<(), ProtocolError> {
        self.write(Outbound::Call {
            function: function.to_string(),
            args,
            reply_index: None,
        })
    }

    /// Evaluates an editor expression and waits for its value.
    pub async fn eval(&mut self, expr: &str) -> Result<Value, ProtocolError> {
        let index = self.begin_call()?;
        self.write(Outbound::Expr {
            expr: expr.to_string(),
            reply_index: Some(index),
        })?;
        self.await_reply().await
    }

    pub fn eval_no_reply(&mut self, expr: &str) -> Result<(), ProtocolError> {
        self.write(Outbound::Expr {
            expr: expr.to_string(),
            reply_index: None,
        })
    }

    /// Runs an ex command in the editor. Ex commands never reply.
    pub fn command(&mut self, command: &str) -> Result<(), ProtocolError> {
        self.write(Outbound::Ex {
            command: command.to_string(),
        })
    }

    /// Next spontaneous message from the editor, oldest deferred one first.
    pub async fn receive_next(&mut self) -> Result<Value, ProtocolError> {
        self.check()?;
        if let CorrelatorState::AwaitingReply(pending) = self.correlator.state() {
            return Err(self.fail(ProtocolError::CallPending { pending }));
        }
        if let Some(payload) = self.correlator.next_deferred() {
            return Ok(payload);
        }

        let envelope = match self.read_envelope().await {
            Ok(envelope) => envelope,
            Err(error) => return Err(self.fail(error)),
        };
        match self.correlator.accept(envelope) {
            Ok(Accepted::Notification(payload)) => Ok(payload),
            Ok(Accepted::Deferred | Accepted::Reply(_)) => {
                unreachable!("an idle correlator only yields notifications")
            }
            Err(error) => Err(self.fail(error)),
        }
    }

    fn begin_call(&mut self) -> Result<i64, ProtocolError> {
        self.check()?;
        self.correlator.begin_call().map_err(|error| self.fail(error))
    }

    async fn await_reply(&mut self) -> Result<Value, ProtocolError> {
        loop {
            let envelope = match self.read_envelope().await {
                Ok(envelope) => envelope,
                Err(error) => {
                    self.correlator.abandon_call();
                    return Err(self.fail(error));
                }
            };
            match self.correlator.accept(envelope) {
                Ok(Accepted::Reply(payload)) => return Ok(payload),
                Ok(Accepted::Deferred) => {
                    log::debug!(
                        "deferred editor message while awaiting {:?} ({} queued)",
                        self.correlator.state(),
                        self.correlator.deferred_len()
                    );
                }
                Ok(Accepted::Notification(_)) => {
                    unreachable!("notifications are deferred while a call is pending")
                }
                Err(error) => return Err(self.fail(error)),
            }
        }
    }

    async fn read_envelope(&mut self) -> Result<Envelope, ProtocolError> {
        self.incoming_rx
            .recv()
            .await
            .map_err(|_| ProtocolError::Disconnected)?
    }

    fn write(&mut self, message: Outbound) -> Result<(), ProtocolError> {
        self.check()?;
        let line = message.to_line();
        log::debug!("write: {}", line);
        if self.outbound_tx.try_send(line).is_err() {
            return Err(self.fail(ProtocolError::Disconnected));
        }
        Ok(())
    }

    fn check(&self) -> Result<(), ProtocolError> {
        match &self.poisoned {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn fail(&mut self, error: ProtocolError) -> ProtocolError {
        log::error!("editor channel failed: {}", error);
        self.poisoned = Some(error.clone());
        error
    }
}

/// The editor's side of a fake [`Connection`].
#[cfg(any(test, feature = "test-support"))]
pub struct FakeEditorEnd {
    incoming_tx: channel::Sender<IncomingResult>,
    outbound_rx: channel::Receiver<String>,
}

#[cfg(any(test, feature = "test-support"))]
impl Connection {
    pub fn fake() -> (Self, FakeEditorEnd) {
        let (outbound_tx, outbound_rx) = channel::unbounded();
        let (incoming_tx, incoming_rx) = channel::unbounded();
        (
            Self::from_channels(outbound_tx, incoming_rx),
            FakeEditorEnd {
                incoming_tx,
                outbound_rx,
            },
        )
    }
}

#[cfg(any(test, feature = "test-support"))]
impl FakeEditorEnd {
    pub fn push(&self, index: i64, payload: Value) {
        self.incoming_tx
            .try_send(Ok(Envelope::new(index, payload)))
            .unwrap();
    }

    pub fn push_line(&self, line: &str) {
        self.incoming_tx.try_send(Envelope::decode(line)).unwrap();
    }

    pub fn close(&self) {
        self.incoming_tx.close();
    }

    pub async fn next_outbound(&self) -> Value {
        let line = self.outbound_rx.recv().await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    pub fn drain_outbound(&self) -> Vec<Value> {
        std::iter::from_fn(|| self.outbound_rx.try_recv().ok())
            .map(|line| serde_json::from_str(&line).unwrap())
            .collect()
    }
}
