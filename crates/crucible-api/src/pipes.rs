//! In-process pipes for forwarding streaming data between nodes.
//!
//! A pipe is a one-shot byte channel: one writer, one reader. The table is
//! guarded by a reader/writer lock and entries disappear once both ends
//! have been claimed.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

struct PipeEntry {
    writer: Option<mpsc::Sender<Bytes>>,
    reader: Option<mpsc::Receiver<Bytes>>,
}

#[derive(Clone, Default)]
pub struct Pipes {
    table: Arc<RwLock<HashMap<Uuid, PipeEntry>>>,
}

impl Pipes {
    pub fn create(&self) -> Uuid {
        let id = Uuid::new_v4();
        let (writer, reader) = mpsc::channel(16);
        self.table.write().unwrap().insert(
            id,
            PipeEntry {
                writer: Some(writer),
                reader: Some(reader),
            },
        );
        id
    }

    /// Claims the write end. `None` if the pipe is unknown or already has a
    /// writer.
    pub fn claim_writer(&self, id: Uuid) -> Option<mpsc::Sender<Bytes>> {
        let mut table = self.table.write().unwrap();
        let entry = table.get_mut(&id)?;
        let writer = entry.writer.take();
        if entry.writer.is_none() && entry.reader.is_none() {
            table.remove(&id);
        }
        writer
    }

    /// Claims the read end. `None` if the pipe is unknown or already has a
    /// reader.
    pub fn claim_reader(&self, id: Uuid) -> Option<mpsc::Receiver<Bytes>> {
        let mut table = self.table.write().unwrap();
        let entry = table.get_mut(&id)?;
        let reader = entry.reader.take();
        if entry.writer.is_none() && entry.reader.is_none() {
            table.remove(&id);
        }
        reader
    }

    pub fn len(&self) -> usize {
        self.table.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().unwrap().is_empty()
    }
}
