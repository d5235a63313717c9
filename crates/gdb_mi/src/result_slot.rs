use crate::record::Record;
use smol::channel::{self, TryRecvError, TrySendError};

/// A single-entry mailbox for result records.
///
/// Only one command is ever outstanding, so only the newest result matters:
/// putting into a full slot replaces what was there.
pub struct ResultSlot {
    tx: channel::Sender<Record>,
    rx: channel::Receiver<Record>,
}

impl Default for ResultSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultSlot {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(1);
        Self { tx, rx }
    }

    pub fn put(&self, record: Record) {
        let mut record = record;
        loop {
            match self.tx.try_send(record) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if let Ok(stale) = self.rx.try_recv() {
                        log::debug!("dropping unclaimed result {:?}", stale.message);
                    }
                    record = rejected;
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }

    pub fn try_take(&self) -> Option<Record> {
        match self.rx.try_recv() {
            Ok(record) => Some(record),
            Err(TryRecvError::Empty | TryRecvError::Closed) => None,
        }
    }

    pub async fn take(&self) -> Option<Record> {
        self.rx.recv().await.ok()
    }

    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
