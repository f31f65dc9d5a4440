//! TCP connection multiplexer.
//!
//! The listener accepts connections in an unknown state; the first record
//! decides their role:
//!
//! - `OPEN` makes a primary client connection. Requests flow to the
//!   engine task; responses flow back through a per-client channel and a
//!   dedicated writer task.
//! - `NOTIFY` on a fresh connection binds it as an existing client's
//!   notification channel; after the ack it only ever carries events.
//! - `OPEN_PRINT_SESSION` on a fresh connection attaches it as the raw
//!   output stream of a print session; everything after the ack is
//!   payload bytes forwarded into the session.
//!
//! Invalid framing (bad magic or version, oversized payload) tears the
//! connection down. A read of zero bytes is a peer close and releases the
//! associated client.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use var_protocol::{
    ClientId, NotifyKind, NotifyMessage, RequestKind, RequestRecord, ResponseRecord, VarErr,
    VarHandle, WireError, EOK, REQUEST_HEADER_LEN,
};

use crate::clients::{TransportKind, MAX_WORKBUF};
use crate::config::Config;
use crate::engine::Engine;

/// Upper bound on a single request payload; anything larger is a framing
/// violation, not a negotiation problem.
const MAX_PAYLOAD: usize = 2 * MAX_WORKBUF;

/// Everything connection tasks can ask of the engine task.
pub enum EngineMsg {
    Open {
        transport: TransportKind,
        uid: u32,
        workbuf_size: usize,
        response_tx: mpsc::UnboundedSender<ResponseRecord>,
        id_tx: oneshot::Sender<Option<ClientId>>,
    },
    Request {
        client: ClientId,
        record: RequestRecord,
    },
    Disconnect {
        client: ClientId,
    },
    BindNotify {
        client: ClientId,
        tx: mpsc::UnboundedSender<NotifyMessage>,
        ack: oneshot::Sender<Result<(), VarErr>>,
    },
    NotifyGone {
        client: ClientId,
    },
    QueueDrained {
        client: ClientId,
        handle: VarHandle,
    },
    RenderAck {
        client: ClientId,
    },
    StreamAttach {
        txn_id: u32,
        ack: oneshot::Sender<Result<(), VarErr>>,
    },
    StreamData {
        txn_id: u32,
        bytes: Vec<u8>,
    },
    StreamClosed {
        txn_id: u32,
        clean: bool,
    },
}

/// The variable server over TCP.
pub struct Server {
    listener: TcpListener,
    config: Config,
}

impl Server {
    /// Bind the listener. Port 0 in the config picks an ephemeral port.
    pub async fn bind(config: Config) -> io::Result<Server> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        Ok(Server { listener, config })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the listener fails. The engine task and one task per
    /// connection run on the surrounding runtime.
    pub async fn run(self) -> io::Result<()> {
        let addr = self.listener.local_addr()?;
        let _info_file = InfoFile::publish(&self.config.info_path, addr)?;

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let mut engine = Engine::new(self.config.max_variables, self.config.max_clients);
        engine.install_stats();
        tokio::spawn(engine_loop(engine, engine_rx));

        info!(%addr, "varserver listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            trace!(%peer, "connection accepted");
            tokio::spawn(connection(stream, engine_tx.clone()));
        }
    }
}

/// Discovery file carrying the server's PID and address; removed when the
/// server stops.
struct InfoFile {
    path: PathBuf,
}

impl InfoFile {
    fn publish(path: &Path, addr: SocketAddr) -> io::Result<InfoFile> {
        let body = format!("{}\n{}\n", std::process::id(), addr);
        std::fs::write(path, body)?;
        Ok(InfoFile {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for InfoFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// The single task owning the engine. One message is handled to
/// completion before the next; the timer drives the statistics windows.
async fn engine_loop(mut engine: Engine, mut rx: mpsc::UnboundedReceiver<EngineMsg>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                handle_msg(&mut engine, msg);
            }
            _ = ticker.tick() => engine.tick(),
        }
    }
    debug!("engine task stopped");
}

fn handle_msg(engine: &mut Engine, msg: EngineMsg) {
    match msg {
        EngineMsg::Open {
            transport,
            uid,
            workbuf_size,
            response_tx,
            id_tx,
        } => {
            let id = engine.handle_open(transport, uid, workbuf_size, response_tx);
            let _ = id_tx.send(id);
        }
        EngineMsg::Request { client, record } => engine.dispatch_record(client, &record),
        EngineMsg::Disconnect { client } => engine.disconnect(client),
        EngineMsg::BindNotify { client, tx, ack } => {
            let _ = ack.send(engine.bind_notify(client, tx));
        }
        EngineMsg::NotifyGone { client } => engine.notify_gone(client),
        EngineMsg::QueueDrained { client, handle } => engine.queue_drained(client, handle),
        EngineMsg::RenderAck { client } => engine.render_ack(client),
        EngineMsg::StreamAttach { txn_id, ack } => {
            let _ = ack.send(engine.print_stream_attach(txn_id));
        }
        EngineMsg::StreamData { txn_id, bytes } => engine.print_stream_data(txn_id, &bytes),
        EngineMsg::StreamClosed { txn_id, clean } => engine.print_stream_closed(txn_id, clean),
    }
}

enum ConnError {
    /// Peer closed in a frame boundary
    Closed,
    Io(io::Error),
    Wire(WireError),
}

async fn read_request<R>(reader: &mut R) -> Result<RequestRecord, ConnError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; REQUEST_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(ConnError::Closed),
        Err(e) => return Err(ConnError::Io(e)),
    }
    let (mut record, payload_len) =
        RequestRecord::decode_header(&header).map_err(ConnError::Wire)?;
    if payload_len > MAX_PAYLOAD {
        return Err(ConnError::Wire(WireError::BadPayload("oversized payload")));
    }
    if payload_len > 0 {
        let mut payload = vec![0u8; payload_len];
        match reader.read_exact(&mut payload).await {
            Ok(_) => record.payload = payload,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(ConnError::Closed),
            Err(e) => return Err(ConnError::Io(e)),
        }
    }
    Ok(record)
}

async fn write_response<W>(writer: &mut W, resp: &ResponseRecord) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&resp.encode()).await
}

/// Dispatch a fresh connection by its first record.
async fn connection(stream: TcpStream, engine_tx: mpsc::UnboundedSender<EngineMsg>) {
    let (mut reader, mut writer) = stream.into_split();
    let first = match read_request(&mut reader).await {
        Ok(record) => record,
        Err(ConnError::Closed) => return,
        Err(ConnError::Wire(err)) => {
            debug!(%err, "bad first record; closing");
            return;
        }
        Err(ConnError::Io(err)) => {
            debug!(%err, "read error on fresh connection");
            return;
        }
    };
    match first.kind {
        RequestKind::Open => client_connection(&first, reader, writer, engine_tx).await,
        RequestKind::Notify => notify_connection(&first, reader, writer, engine_tx).await,
        RequestKind::OpenPrintSession => stream_connection(&first, reader, writer, engine_tx).await,
        other => {
            debug!(kind = other.code(), "unexpected first record kind");
            let _ = write_response(&mut writer, &ResponseRecord::err(VarErr::Inval)).await;
        }
    }
}

/// Primary client connection: OPEN handshake, then the request loop.
async fn client_connection(
    first: &RequestRecord,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    engine_tx: mpsc::UnboundedSender<EngineMsg>,
) {
    let (response_tx, mut response_rx) = mpsc::unbounded_channel();
    let (id_tx, id_rx) = oneshot::channel();
    let open = EngineMsg::Open {
        transport: TransportKind::Tcp,
        uid: first.arg2,
        workbuf_size: first.arg1 as usize,
        response_tx,
        id_tx,
    };
    if engine_tx.send(open).is_err() {
        return;
    }
    let client = match id_rx.await {
        Ok(Some(id)) => Some(id),
        Ok(None) => None,
        Err(_) => return,
    };

    // Writer task: relays engine responses to the socket. A success frame
    // with a nonzero result1 is a render chunk with more to come; the ack
    // lets the engine feed the next one.
    let ack_tx = engine_tx.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(resp) = response_rx.recv().await {
            let wants_ack = client.is_some() && resp.code == EOK && resp.result1 > 0;
            if write_response(&mut writer, &resp).await.is_err() {
                break;
            }
            if wants_ack {
                if let Some(client) = client {
                    if ack_tx.send(EngineMsg::RenderAck { client }).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let Some(client) = client else {
        // OPEN refused; the writer task delivers the error response
        let _ = writer_task.await;
        return;
    };

    loop {
        match read_request(&mut reader).await {
            Ok(record) => {
                if engine_tx.send(EngineMsg::Request { client, record }).is_err() {
                    break;
                }
            }
            Err(ConnError::Closed) => {
                debug!(client = client.id(), "peer closed");
                let _ = engine_tx.send(EngineMsg::Disconnect { client });
                break;
            }
            Err(ConnError::Wire(err)) => {
                warn!(client = client.id(), %err, "framing violation; closing");
                let _ = engine_tx.send(EngineMsg::Disconnect { client });
                break;
            }
            Err(ConnError::Io(err)) => {
                debug!(client = client.id(), %err, "read error");
                let _ = engine_tx.send(EngineMsg::Disconnect { client });
                break;
            }
        }
    }
    let _ = writer_task.await;
}

/// Secondary connection bound as a client's NOTIFY channel.
async fn notify_connection(
    first: &RequestRecord,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    engine_tx: mpsc::UnboundedSender<EngineMsg>,
) {
    let client = ClientId::new(first.client_id);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (ack_tx, ack_rx) = oneshot::channel();
    if engine_tx
        .send(EngineMsg::BindNotify {
            client,
            tx,
            ack: ack_tx,
        })
        .is_err()
    {
        return;
    }
    let bound = ack_rx.await.unwrap_or(Err(VarErr::NoEnt));
    let ack = match bound {
        Ok(()) => ResponseRecord::ok(),
        Err(err) => ResponseRecord::err(err),
    };
    if write_response(&mut writer, &ack).await.is_err() || bound.is_err() {
        return;
    }

    let mut probe = [0u8; 64];
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let drained = event.kind == NotifyKind::ModifiedQueue;
                let handle = event.handle;
                if write_response(&mut writer, &event.to_record()).await.is_err() {
                    let _ = engine_tx.send(EngineMsg::NotifyGone { client });
                    break;
                }
                // The queued payload reached the consumer: re-arm dedup
                if drained {
                    let _ = engine_tx.send(EngineMsg::QueueDrained { client, handle });
                }
            }
            read = reader.read(&mut probe) => {
                match read {
                    Ok(0) | Err(_) => {
                        debug!(client = client.id(), "notify channel closed");
                        let _ = engine_tx.send(EngineMsg::NotifyGone { client });
                        break;
                    }
                    Ok(_) => {
                        // Nothing is expected inbound on a notify channel
                        trace!(client = client.id(), "ignoring bytes on notify channel");
                    }
                }
            }
        }
    }
}

/// Raw output stream of a print session.
async fn stream_connection(
    first: &RequestRecord,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    engine_tx: mpsc::UnboundedSender<EngineMsg>,
) {
    let txn_id = first.txn_id;
    let (ack_tx, ack_rx) = oneshot::channel();
    if engine_tx
        .send(EngineMsg::StreamAttach {
            txn_id,
            ack: ack_tx,
        })
        .is_err()
    {
        return;
    }
    let attached = ack_rx.await.unwrap_or(Err(VarErr::NoEnt));
    let ack = match attached {
        Ok(()) => ResponseRecord::ok().with_txn(txn_id),
        Err(err) => ResponseRecord::err(err),
    };
    if write_response(&mut writer, &ack).await.is_err() || attached.is_err() {
        return;
    }

    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = engine_tx.send(EngineMsg::StreamClosed {
                    txn_id,
                    clean: true,
                });
                break;
            }
            Ok(n) => {
                let msg = EngineMsg::StreamData {
                    txn_id,
                    bytes: buf[..n].to_vec(),
                };
                if engine_tx.send(msg).is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(txn_id, %err, "print stream error");
                let _ = engine_tx.send(EngineMsg::StreamClosed {
                    txn_id,
                    clean: false,
                });
                break;
            }
        }
    }
}
