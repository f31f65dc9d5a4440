//! TCP client library for the variable server.
//!
//! [`VarClient`] is the primary channel: one method per request kind,
//! strictly request/response. [`NotifyChannel`] is the secondary channel
//! a subscriber binds to receive events. [`PrintStream`] is the raw
//! output stream a print worker attaches to a delegated session.

pub mod error;

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use var_protocol::payload::{decode_aliases, decode_iteration_item};
use var_protocol::{
    ClientId, NotifyKind, NotifyMessage, Request, RequestKind, RequestRecord, ResponseRecord,
    SearchQuery, VarErr, VarHandle, VarInfo, VarType, VarValue, EOK, RESPONSE_HEADER_LEN,
};

pub use error::ClientError;

async fn read_response(stream: &mut TcpStream) -> Result<ResponseRecord, ClientError> {
    let mut header = [0u8; RESPONSE_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let (mut record, payload_len) = ResponseRecord::decode_header(&header)?;
    if payload_len > 0 {
        let mut payload = vec![0u8; payload_len];
        stream.read_exact(&mut payload).await?;
        record.payload = payload;
    }
    Ok(record)
}

/// One item yielded by GET_FIRST / GET_NEXT.
#[derive(Debug, Clone, PartialEq)]
pub struct IterItem {
    pub handle: VarHandle,
    pub context: u32,
    pub name: String,
    pub value: VarValue,
}

/// Primary connection to the server.
pub struct VarClient {
    stream: TcpStream,
    client_id: u16,
    server_addr: SocketAddr,
}

impl VarClient {
    /// Connect and perform the OPEN handshake.
    pub async fn connect(
        addr: SocketAddr,
        workbuf_size: u32,
        uid: u32,
    ) -> Result<VarClient, ClientError> {
        let mut stream = TcpStream::connect(addr).await?;
        let open = Request::Open { workbuf_size, uid }.to_record(0);
        stream.write_all(&open.encode()).await?;
        let resp = read_response(&mut stream).await?;
        resp.status()?;
        let client_id = resp.result1 as u16;
        debug!(client_id, "session open");
        Ok(VarClient {
            stream,
            client_id,
            server_addr: addr,
        })
    }

    #[must_use]
    pub fn id(&self) -> u16 {
        self.client_id
    }

    #[must_use]
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Bind a NOTIFY channel for this client on a second connection.
    pub async fn open_notify_channel(&self) -> Result<NotifyChannel, ClientError> {
        NotifyChannel::open(self.server_addr, self.client_id).await
    }

    async fn roundtrip(&mut self, request: &Request) -> Result<ResponseRecord, ClientError> {
        let record = request.to_record(self.client_id);
        self.stream.write_all(&record.encode()).await?;
        let resp = read_response(&mut self.stream).await?;
        resp.status()?;
        Ok(resp)
    }

    /// Request/response where the payload may arrive chunked: a success
    /// frame with nonzero `result1` announces that many more bytes.
    async fn roundtrip_chunked(&mut self, request: &Request) -> Result<Vec<u8>, ClientError> {
        let mut resp = self.roundtrip(request).await?;
        let mut payload = std::mem::take(&mut resp.payload);
        let mut remaining = resp.result1;
        while remaining > 0 {
            let next = read_response(&mut self.stream).await?;
            next.status()?;
            payload.extend_from_slice(&next.payload);
            remaining = next.result1;
        }
        Ok(payload)
    }

    /// Connectivity test; the server echoes the token.
    pub async fn echo(&mut self, token: u32) -> Result<u32, ClientError> {
        let resp = self.roundtrip(&Request::Echo { token }).await?;
        Ok(resp.result1 as u32)
    }

    pub async fn create(&mut self, info: VarInfo) -> Result<VarHandle, ClientError> {
        let resp = self.roundtrip(&Request::New { info }).await?;
        Ok(VarHandle::new(resp.result1 as u32))
    }

    pub async fn alias(
        &mut self,
        handle: VarHandle,
        name: impl Into<String>,
    ) -> Result<VarHandle, ClientError> {
        let resp = self
            .roundtrip(&Request::Alias {
                handle,
                name: name.into(),
            })
            .await?;
        Ok(VarHandle::new(resp.result1 as u32))
    }

    pub async fn get_aliases(&mut self, handle: VarHandle) -> Result<Vec<VarHandle>, ClientError> {
        let resp = self.roundtrip(&Request::GetAliases { handle }).await?;
        Ok(decode_aliases(&resp.payload)?)
    }

    pub async fn find(&mut self, name: impl Into<String>) -> Result<VarHandle, ClientError> {
        let resp = self.roundtrip(&Request::Find { name: name.into() }).await?;
        Ok(VarHandle::new(resp.result1 as u32))
    }

    pub async fn get(&mut self, handle: VarHandle) -> Result<VarValue, ClientError> {
        let payload = self.roundtrip_chunked(&Request::Get { handle }).await?;
        let (value, consumed) = VarValue::decode(&payload)?;
        if consumed != payload.len() {
            return Err(ClientError::Wire(var_protocol::WireError::BadPayload(
                "trailing bytes after value",
            )));
        }
        Ok(value)
    }

    pub async fn set(&mut self, handle: VarHandle, value: VarValue) -> Result<(), ClientError> {
        self.roundtrip(&Request::Set { handle, value }).await?;
        Ok(())
    }

    /// Render the variable. Output produced by a print subscriber arrives
    /// the same way as serverside rendering.
    pub async fn print(&mut self, handle: VarHandle) -> Result<String, ClientError> {
        let payload = self.roundtrip_chunked(&Request::Print { handle }).await?;
        String::from_utf8(payload)
            .map_err(|_| ClientError::Wire(var_protocol::WireError::BadUtf8))
    }

    pub async fn var_type(&mut self, handle: VarHandle) -> Result<VarType, ClientError> {
        let resp = self.roundtrip(&Request::Type { handle }).await?;
        VarType::from_tag(resp.result1 as u8).ok_or(ClientError::Wire(
            var_protocol::WireError::BadTag(resp.result1 as u8),
        ))
    }

    pub async fn name_of(&mut self, handle: VarHandle) -> Result<String, ClientError> {
        let resp = self.roundtrip(&Request::Name { handle }).await?;
        String::from_utf8(resp.payload)
            .map_err(|_| ClientError::Wire(var_protocol::WireError::BadUtf8))
    }

    pub async fn length(&mut self, handle: VarHandle) -> Result<u64, ClientError> {
        let resp = self.roundtrip(&Request::Length { handle }).await?;
        Ok(resp.result1)
    }

    pub async fn flags(&mut self, handle: VarHandle) -> Result<u32, ClientError> {
        let resp = self.roundtrip(&Request::Flags { handle }).await?;
        Ok(resp.result1 as u32)
    }

    pub async fn info(&mut self, handle: VarHandle) -> Result<VarInfo, ClientError> {
        let resp = self.roundtrip(&Request::Info { handle }).await?;
        Ok(VarInfo::decode(&resp.payload)?)
    }

    pub async fn notify(&mut self, handle: VarHandle, kind: NotifyKind) -> Result<(), ClientError> {
        self.roundtrip(&Request::Notify { handle, kind }).await?;
        Ok(())
    }

    pub async fn notify_cancel(
        &mut self,
        handle: VarHandle,
        kind: NotifyKind,
    ) -> Result<(), ClientError> {
        self.roundtrip(&Request::NotifyCancel { handle, kind })
            .await?;
        Ok(())
    }

    /// Fetch the proposed value of a validation in progress.
    pub async fn get_validation_request(
        &mut self,
        txn_id: u32,
    ) -> Result<(VarHandle, VarValue), ClientError> {
        let resp = self
            .roundtrip(&Request::GetValidationRequest { txn_id })
            .await?;
        let (value, _) = VarValue::decode(&resp.payload)?;
        Ok((VarHandle::new(resp.result1 as u32), value))
    }

    /// Answer a validation. `Ok(())` commits; an error code is handed to
    /// the setter verbatim.
    pub async fn send_validation_response(
        &mut self,
        txn_id: u32,
        verdict: Result<(), VarErr>,
    ) -> Result<(), ClientError> {
        let code = match verdict {
            Ok(()) => EOK,
            Err(err) => err.code(),
        };
        self.roundtrip(&Request::SendValidationResponse { txn_id, code })
            .await?;
        Ok(())
    }

    /// Returns the variable handle and the requesting client id.
    pub async fn open_print_session(
        &mut self,
        txn_id: u32,
    ) -> Result<(VarHandle, ClientId), ClientError> {
        let resp = self.roundtrip(&Request::OpenPrintSession { txn_id }).await?;
        Ok((
            VarHandle::new(resp.result1 as u32),
            ClientId::new(resp.result2 as u16),
        ))
    }

    pub async fn close_print_session(&mut self, txn_id: u32) -> Result<(), ClientError> {
        self.roundtrip(&Request::ClosePrintSession { txn_id })
            .await?;
        Ok(())
    }

    /// Attach the raw output stream for a delegated print session.
    pub async fn attach_print_stream(&self, txn_id: u32) -> Result<PrintStream, ClientError> {
        PrintStream::attach(self.server_addr, txn_id).await
    }

    /// Start a query. `Ok(None)` means nothing matched.
    pub async fn get_first(
        &mut self,
        query: SearchQuery,
    ) -> Result<Option<IterItem>, ClientError> {
        self.iteration(&Request::GetFirst { query }).await
    }

    /// Continue a query. `Ok(None)` means the traversal is done.
    pub async fn get_next(&mut self, context: u32) -> Result<Option<IterItem>, ClientError> {
        self.iteration(&Request::GetNext { context }).await
    }

    async fn iteration(&mut self, request: &Request) -> Result<Option<IterItem>, ClientError> {
        let resp = match self.roundtrip(request).await {
            Ok(resp) => resp,
            Err(ClientError::Server(VarErr::NoEnt)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let (name, value) = decode_iteration_item(&resp.payload)?;
        Ok(Some(IterItem {
            handle: VarHandle::new(resp.result1 as u32),
            context: resp.result2,
            name,
            value,
        }))
    }

    pub async fn set_flags(&mut self, handle: VarHandle, mask: u32) -> Result<u32, ClientError> {
        let resp = self.roundtrip(&Request::SetFlags { handle, mask }).await?;
        Ok(resp.result1 as u32)
    }

    pub async fn clear_flags(&mut self, handle: VarHandle, mask: u32) -> Result<u32, ClientError> {
        let resp = self.roundtrip(&Request::ClearFlags { handle, mask }).await?;
        Ok(resp.result1 as u32)
    }

    /// Graceful close; the server releases the client record.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.roundtrip(&Request::Close).await?;
        Ok(())
    }
}

/// Secondary connection carrying asynchronous events.
#[derive(Debug)]
pub struct NotifyChannel {
    stream: TcpStream,
}

impl NotifyChannel {
    /// Bind a fresh connection as `client_id`'s notification channel.
    pub async fn open(addr: SocketAddr, client_id: u16) -> Result<NotifyChannel, ClientError> {
        let mut stream = TcpStream::connect(addr).await?;
        // The bind marker is a NOTIFY record on a fresh connection
        let record = RequestRecord {
            client_id,
            kind: RequestKind::Notify,
            arg1: 0,
            arg2: NotifyKind::Modified.code(),
            txn_id: 0,
            payload: Vec::new(),
        };
        stream.write_all(&record.encode()).await?;
        let ack = read_response(&mut stream).await?;
        ack.status()?;
        Ok(NotifyChannel { stream })
    }

    /// The next event. Blocks until the server sends one.
    pub async fn recv(&mut self) -> Result<NotifyMessage, ClientError> {
        let record = read_response(&mut self.stream).await?;
        Ok(NotifyMessage::from_record(&record)?)
    }
}

/// Raw output stream for a delegated print session.
pub struct PrintStream {
    stream: TcpStream,
}

impl PrintStream {
    pub async fn attach(addr: SocketAddr, txn_id: u32) -> Result<PrintStream, ClientError> {
        let mut stream = TcpStream::connect(addr).await?;
        let record = RequestRecord {
            client_id: 0,
            kind: RequestKind::OpenPrintSession,
            arg1: 0,
            arg2: 0,
            txn_id,
            payload: Vec::new(),
        };
        stream.write_all(&record.encode()).await?;
        let ack = read_response(&mut stream).await?;
        ack.status()?;
        Ok(PrintStream { stream })
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Close the stream. The session stays open until the worker sends
    /// CLOSE_PRINT_SESSION on its primary channel.
    pub async fn finish(mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
