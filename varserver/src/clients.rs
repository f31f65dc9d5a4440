//! Client registry.
//!
//! Active client records live in a fixed slot table indexed by client id;
//! freed ids go to a free list and are handed out again before the table
//! grows. Each record holds the client's response channel (the engine's
//! only way to answer it) and, once bound, the NOTIFY channel used for
//! asynchronous events.

use tokio::sync::mpsc;

use var_protocol::{ClientId, NotifyMessage, ResponseRecord, VarErr};

/// How the client reached the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    /// In-process: the server's own variables and engine-level tests
    Local,
}

impl TransportKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Local => "local",
        }
    }
}

/// Smallest and largest negotiable working buffer.
pub const MIN_WORKBUF: usize = 256;
pub const MAX_WORKBUF: usize = 1 << 20;

#[derive(Debug)]
pub struct ClientRecord {
    pub id: ClientId,
    pub transport: TransportKind,
    pub uid: u32,
    /// Negotiated scratch size; variable-length results are chunked to it
    pub workbuf_size: usize,
    pub response_tx: mpsc::UnboundedSender<ResponseRecord>,
    pub notify_tx: Option<mpsc::UnboundedSender<NotifyMessage>>,
    pub blocked: bool,
    /// Requests dispatched for this client
    pub request_count: u64,
    pub debug_level: u8,
}

pub struct ClientRegistry {
    slots: Vec<Option<ClientRecord>>,
    free: Vec<u16>,
    next_unused: u16,
    max_clients: u16,
}

impl ClientRegistry {
    #[must_use]
    pub fn new(max_clients: u16) -> Self {
        let mut slots = Vec::with_capacity(usize::from(max_clients) + 1);
        slots.resize_with(usize::from(max_clients) + 1, || None);
        Self {
            slots,
            free: Vec::new(),
            next_unused: 1,
            max_clients,
        }
    }

    /// Allocate a record. Ids from the free list are reused first.
    pub fn allocate(
        &mut self,
        transport: TransportKind,
        uid: u32,
        workbuf_size: usize,
        response_tx: mpsc::UnboundedSender<ResponseRecord>,
    ) -> Result<ClientId, VarErr> {
        let id = if let Some(id) = self.free.pop() {
            id
        } else if self.next_unused <= self.max_clients {
            let id = self.next_unused;
            self.next_unused += 1;
            id
        } else {
            return Err(VarErr::NoMem);
        };
        let client_id = ClientId::new(id);
        self.slots[usize::from(id)] = Some(ClientRecord {
            id: client_id,
            transport,
            uid,
            workbuf_size: workbuf_size.clamp(MIN_WORKBUF, MAX_WORKBUF),
            response_tx,
            notify_tx: None,
            blocked: false,
            request_count: 0,
            debug_level: 0,
        });
        Ok(client_id)
    }

    #[must_use]
    pub fn get(&self, id: ClientId) -> Option<&ClientRecord> {
        self.slots.get(usize::from(id.id()))?.as_ref()
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut ClientRecord> {
        self.slots.get_mut(usize::from(id.id()))?.as_mut()
    }

    /// Return the record to the free list.
    pub fn release(&mut self, id: ClientId) -> Option<ClientRecord> {
        let slot = self.slots.get_mut(usize::from(id.id()))?;
        let record = slot.take()?;
        self.free.push(id.id());
        Some(record)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientRecord> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
