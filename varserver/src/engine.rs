//! The engine: request dispatcher and transaction orchestrator.
//!
//! One engine instance owns the whole state machine. Every method runs to
//! completion before the next message is handled, so no locking exists
//! anywhere in here; connection tasks reach the engine only through the
//! server's message channel.
//!
//! A handler either answers immediately, or creates a transaction plus a
//! blocked-queue entry and answers nothing. Completion paths (validation
//! responses, calculator writes, print session closes, peer teardown)
//! later push the final response through the blocked client's channel.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use var_protocol::payload::{encode_aliases, encode_iteration_item};
use var_protocol::{
    ChangeRecord, ClientId, NotifyKind, NotifyMessage, Request, RequestRecord, ResponseRecord,
    SearchQuery, VarErr, VarHandle, VarInfo, VarValue, WireError, EOK,
};

use crate::blocked::{BlockReason, BlockedEntry, BlockedQueue, UnblockMode};
use crate::clients::{ClientRegistry, TransportKind};
use crate::name_index::NameIndex;
use crate::notify::NotifyRegistry;
use crate::render::render_value;
use crate::search::{QuerySpec, SearchContexts};
use crate::stats::{ClientInfoEntry, StatCounters, StatVars};
use crate::store::{VarFlags, VarStore};
use crate::tags::TagTable;
use crate::txn::{TxnState, TxnTable};

/// What a handler decided.
enum Outcome {
    /// Answer now
    Reply(ResponseRecord),
    /// A peer must act first; the client stays silent on the wire
    Deferred,
    /// The handler already pushed its response(s)
    Done,
}

pub struct Engine {
    index: NameIndex,
    tags: TagTable,
    store: VarStore,
    notify: NotifyRegistry,
    txns: TxnTable,
    blocked: BlockedQueue,
    clients: ClientRegistry,
    contexts: SearchContexts,
    counters: StatCounters,
    stat_vars: Option<StatVars>,
}

impl Engine {
    #[must_use]
    pub fn new(max_variables: usize, max_clients: u16) -> Self {
        Self {
            index: NameIndex::new(max_variables),
            tags: TagTable::new(),
            store: VarStore::new(max_variables),
            notify: NotifyRegistry::new(),
            txns: TxnTable::new(),
            blocked: BlockedQueue::new(),
            clients: ClientRegistry::new(max_clients),
            contexts: SearchContexts::new(),
            counters: StatCounters::default(),
            stat_vars: None,
        }
    }

    /// Current blocked-queue depth.
    #[must_use]
    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    // ------------------------------------------------------------------
    // Connection-facing entry points
    // ------------------------------------------------------------------

    /// Handle OPEN from a fresh connection. The response travels on the
    /// offered channel either way; the id is returned so the connection
    /// task can route subsequent requests.
    pub fn handle_open(
        &mut self,
        transport: TransportKind,
        uid: u32,
        workbuf_size: usize,
        response_tx: mpsc::UnboundedSender<ResponseRecord>,
    ) -> Option<ClientId> {
        self.count_op(var_protocol::RequestKind::Open);
        match self
            .clients
            .allocate(transport, uid, workbuf_size, response_tx.clone())
        {
            Ok(id) => {
                info!(client = id.id(), uid, "client connected");
                self.push_response(id, ResponseRecord::ok().with_result1(u64::from(id.id())));
                self.publish_client_info();
                Some(id)
            }
            Err(err) => {
                warn!(uid, %err, "client table full");
                let _ = response_tx.send(ResponseRecord::err(err));
                None
            }
        }
    }

    /// Parse and dispatch one framed request.
    pub fn dispatch_record(&mut self, client: ClientId, record: &RequestRecord) {
        match Request::from_record(record) {
            Ok(request) => self.dispatch(client, request),
            Err(err) => {
                let code = match err {
                    WireError::BadKind(_) => VarErr::NotSup,
                    _ => VarErr::Inval,
                };
                debug!(client = client.id(), %err, "unparseable request");
                self.count_op(record.kind);
                self.push_response(client, ResponseRecord::err(code));
            }
        }
    }

    /// Dispatch one typed request for an open client.
    pub fn dispatch(&mut self, client: ClientId, request: Request) {
        if self.clients.get(client).is_none() {
            warn!(client = client.id(), "request from unknown client");
            return;
        }
        let kind = request.kind();
        self.count_op(kind);
        if let Some(record) = self.clients.get_mut(client) {
            record.request_count += 1;
        }
        trace!(client = client.id(), op = kind.name(), "dispatch");

        let outcome = match request {
            // A second OPEN on an established connection is a protocol error
            Request::Open { .. } => Err(VarErr::Inval),
            Request::Close => Ok(self.op_close(client)),
            Request::Echo { token } => Ok(Outcome::Reply(
                ResponseRecord::ok().with_result1(u64::from(token)),
            )),
            Request::New { info } => self.op_new(&info),
            Request::Alias { handle, name } => self.op_alias(handle, &name),
            Request::GetAliases { handle } => self.op_get_aliases(client, handle),
            Request::Find { name } => self.op_find(&name),
            Request::Get { handle } => self.op_get(client, handle),
            Request::Print { handle } => self.op_print(client, handle),
            Request::Set { handle, value } => self.op_set(client, handle, value),
            Request::Type { handle } => self.op_type(handle),
            Request::Name { handle } => self.op_name(handle),
            Request::Length { handle } => self.op_length(handle),
            Request::Flags { handle } => self.op_flags(handle),
            Request::Info { handle } => self.op_info(client, handle),
            Request::Notify { handle, kind } => self.op_notify(client, handle, kind),
            Request::NotifyCancel { handle, kind } => self.op_notify_cancel(client, handle, kind),
            Request::GetValidationRequest { txn_id } => {
                self.op_get_validation_request(client, txn_id)
            }
            Request::SendValidationResponse { txn_id, code } => {
                self.op_send_validation_response(txn_id, code)
            }
            Request::OpenPrintSession { txn_id } => self.op_open_print_session(txn_id),
            Request::ClosePrintSession { txn_id } => self.op_close_print_session(txn_id),
            Request::GetFirst { query } => self.op_get_first(client, &query),
            Request::GetNext { context } => self.op_get_next(client, context),
            Request::SetFlags { handle, mask } => self.op_change_flags(handle, mask, true),
            Request::ClearFlags { handle, mask } => self.op_change_flags(handle, mask, false),
        };

        match outcome {
            Ok(Outcome::Reply(resp)) => self.push_response(client, resp),
            Ok(Outcome::Deferred) => {
                if let Some(record) = self.clients.get_mut(client) {
                    record.blocked = true;
                }
                trace!(client = client.id(), op = kind.name(), "deferred");
            }
            Ok(Outcome::Done) => {}
            Err(err) => {
                debug!(client = client.id(), op = kind.name(), %err, "refused");
                self.push_response(client, ResponseRecord::err(err));
            }
        }
    }

    /// Bind a NOTIFY channel to an open client.
    pub fn bind_notify(
        &mut self,
        client: ClientId,
        tx: mpsc::UnboundedSender<NotifyMessage>,
    ) -> Result<(), VarErr> {
        let record = self.clients.get_mut(client).ok_or(VarErr::NoEnt)?;
        record.notify_tx = Some(tx);
        debug!(client = client.id(), "notify channel bound");
        Ok(())
    }

    /// The NOTIFY channel closed without the client disconnecting.
    pub fn notify_gone(&mut self, client: ClientId) {
        if let Some(record) = self.clients.get_mut(client) {
            record.notify_tx = None;
        }
    }

    /// A queued notification reached the consumer; arm the next posting.
    pub fn queue_drained(&mut self, client: ClientId, handle: VarHandle) {
        if let Some(canonical) = self.store.canonical(handle) {
            self.notify.rearm(canonical, client);
        }
    }

    /// The connection wrote a render chunk; feed it the next one.
    pub fn render_ack(&mut self, client: ClientId) {
        let popped = {
            let Some(entry) = self.blocked.render_entry_mut(client) else {
                return;
            };
            let BlockReason::Render { parts } = &mut entry.reason else {
                return;
            };
            let part = parts.pop_front();
            let remaining: usize = parts.iter().map(Vec::len).sum();
            (part, remaining)
        };
        match popped {
            (Some(part), remaining) => {
                self.push_response(
                    client,
                    ResponseRecord::ok()
                        .with_result1(remaining as u64)
                        .with_payload(part),
                );
                if remaining == 0 {
                    self.finish_render(client);
                }
            }
            (None, _) => self.finish_render(client),
        }
    }

    fn finish_render(&mut self, client: ClientId) {
        self.blocked.finish_render(client);
        if let Some(record) = self.clients.get_mut(client) {
            record.blocked = false;
        }
    }

    /// A print worker attached its output stream to a session.
    pub fn print_stream_attach(&mut self, txn_id: u32) -> Result<(), VarErr> {
        let txn = self.txns.get_mut(txn_id).ok_or(VarErr::NoEnt)?;
        let TxnState::Print {
            stream_attached, ..
        } = &mut txn.state
        else {
            return Err(VarErr::NoEnt);
        };
        if *stream_attached {
            return Err(VarErr::Exist);
        }
        *stream_attached = true;
        Ok(())
    }

    /// Bytes from an attached print stream.
    pub fn print_stream_data(&mut self, txn_id: u32, bytes: &[u8]) {
        if let Some(txn) = self.txns.get_mut(txn_id) {
            if let TxnState::Print { output, .. } = &mut txn.state {
                output.extend_from_slice(bytes);
            }
        }
    }

    /// The print stream ended. A broken stream aborts the session and
    /// answers the requester with ESTRPIPE.
    pub fn print_stream_closed(&mut self, txn_id: u32, clean: bool) {
        if clean {
            return;
        }
        let Some(_txn) = self.txns.remove(txn_id) else {
            return;
        };
        warn!(txn_id, "print stream broke mid-session");
        if let Some(entry) = self.blocked.take_by_txn(txn_id) {
            self.unblock(entry.client);
            self.push_response(entry.client, ResponseRecord::err(VarErr::StrPipe));
        }
    }

    /// Full teardown on disconnect (or after CLOSE).
    pub fn disconnect(&mut self, client: ClientId) {
        if self.clients.get(client).is_none() {
            return;
        }
        self.teardown_client(client);
    }

    /// One-second statistics tick.
    pub fn tick(&mut self) {
        let rps = self.counters.roll_window();
        let Some(stats) = &self.stat_vars else {
            return;
        };
        let mut updates: Vec<(VarHandle, VarValue)> = vec![
            (stats.total_requests, VarValue::UInt64(self.counters.total)),
            (stats.rps, VarValue::UInt32(rps)),
            (
                stats.blocked_clients,
                VarValue::UInt16(u16::try_from(self.blocked.len()).unwrap_or(u16::MAX)),
            ),
        ];
        for (i, handle) in stats.per_op.iter().enumerate() {
            updates.push((*handle, VarValue::UInt64(self.counters.per_op[i])));
        }
        for (handle, value) in updates {
            if handle.is_valid() {
                self.commit_set(handle, value);
            }
        }
    }

    // ------------------------------------------------------------------
    // Operation handlers
    // ------------------------------------------------------------------

    fn op_close(&mut self, client: ClientId) -> Outcome {
        self.push_response(client, ResponseRecord::ok());
        self.teardown_client(client);
        Outcome::Done
    }

    fn op_new(&mut self, info: &VarInfo) -> Result<Outcome, VarErr> {
        let handle = self.create_variable(info, VarFlags::from_bits_truncate(info.flags))?;
        debug!(name = %info.name, handle = handle.id(), "variable created");
        Ok(Outcome::Reply(
            ResponseRecord::ok().with_result1(u64::from(handle.id())),
        ))
    }

    fn op_alias(&mut self, handle: VarHandle, name: &str) -> Result<Outcome, VarErr> {
        let canonical = self.store.canonical(handle).ok_or(VarErr::NoEnt)?;
        if self.index.contains(name) {
            return Err(VarErr::Exist);
        }
        if self.index.is_full() || self.store.is_full() {
            return Err(VarErr::NoMem);
        }
        // A fresh alias carries no subscriptions of its own, so there is
        // nothing to merge into the canonical record here; the one-per-kind
        // rule for CALC/VALIDATE/PRINT is enforced at registration.
        let alias = self.store.add_alias(canonical)?;
        self.index.insert(name, alias)?;
        debug!(name, alias = alias.id(), canonical = canonical.id(), "alias added");
        Ok(Outcome::Reply(
            ResponseRecord::ok().with_result1(u64::from(alias.id())),
        ))
    }

    fn op_get_aliases(&mut self, client: ClientId, handle: VarHandle) -> Result<Outcome, VarErr> {
        let handles = self.store.aliases_of(handle).ok_or(VarErr::NoEnt)?;
        let mut payload = Vec::with_capacity(2 + handles.len() * 4);
        encode_aliases(&handles, &mut payload);
        if payload.len() > self.client_workbuf(client) {
            return Err(VarErr::TooBig);
        }
        Ok(Outcome::Reply(
            ResponseRecord::ok()
                .with_result2(handles.len() as u32)
                .with_payload(payload),
        ))
    }

    fn op_find(&mut self, name: &str) -> Result<Outcome, VarErr> {
        let handle = self.index.lookup(name).ok_or(VarErr::NoEnt)?;
        Ok(Outcome::Reply(
            ResponseRecord::ok().with_result1(u64::from(handle.id())),
        ))
    }

    fn op_get(&mut self, client: ClientId, handle: VarHandle) -> Result<Outcome, VarErr> {
        let uid = self.client_uid(client);
        let (canonical, value, readable) = {
            let var = self.store.get(handle).ok_or(VarErr::NoEnt)?;
            (var.handle, var.value.clone(), var.acl.can_read(uid))
        };
        if !readable {
            return Err(VarErr::Access);
        }
        if let Some((calc_client, requested)) = self.notify.exclusive(canonical, NotifyKind::Calc)
        {
            // The calculator reads its own variable directly
            if calc_client != client {
                if let Some(outcome) =
                    self.defer_calc(client, canonical, calc_client, requested, UnblockMode::GetValue)?
                {
                    return Ok(outcome);
                }
            }
        }
        Ok(self.reply_chunked(client, ResponseRecord::ok(), value.to_bytes()))
    }

    fn op_set(
        &mut self,
        client: ClientId,
        handle: VarHandle,
        value: VarValue,
    ) -> Result<Outcome, VarErr> {
        let uid = self.client_uid(client);
        let (canonical, var_type, writable, readonly) = {
            let var = self.store.get(handle).ok_or(VarErr::NoEnt)?;
            (
                var.handle,
                var.value.var_type(),
                var.acl.can_write(uid),
                var.flags.contains(VarFlags::READONLY),
            )
        };
        if !writable {
            return Err(VarErr::Access);
        }
        if readonly {
            return Err(VarErr::NotSup);
        }
        let converted = value.convert_to(var_type)?;

        if let Some((v_client, v_handle)) = self.notify.exclusive(canonical, NotifyKind::Validate)
        {
            // The validator's own writes commit without validation
            if v_client != client {
                let txn_id = self.txns.create(
                    client,
                    v_client,
                    canonical,
                    TxnState::Validate {
                        proposed: converted.clone(),
                    },
                )?;
                let msg = NotifyMessage {
                    kind: NotifyKind::Validate,
                    handle: v_handle,
                    txn_id,
                    payload: Vec::new(),
                };
                if self.send_notify(v_client, msg) {
                    self.blocked.push(BlockedEntry {
                        client,
                        reason: BlockReason::NotifyValidate,
                        handle: canonical,
                        txn_id,
                        mode: UnblockMode::SetResult,
                    });
                    return Ok(Outcome::Deferred);
                }
                // Validator is gone: drop it and commit directly
                self.txns.remove(txn_id);
                self.notify.tombstone(canonical, NotifyKind::Validate, v_client);
            }
        }
        self.commit_set(canonical, converted);
        Ok(Outcome::Reply(ResponseRecord::ok()))
    }

    fn op_print(&mut self, client: ClientId, handle: VarHandle) -> Result<Outcome, VarErr> {
        let uid = self.client_uid(client);
        let (canonical, value, format, readable, password) = {
            let var = self.store.get(handle).ok_or(VarErr::NoEnt)?;
            (
                var.handle,
                var.value.clone(),
                var.format.clone(),
                var.acl.can_read(uid),
                var.flags.contains(VarFlags::PASSWORD),
            )
        };
        if !readable {
            return Err(VarErr::Access);
        }
        if password {
            return Err(VarErr::NotSup);
        }
        if let Some((p_client, p_handle)) = self.notify.exclusive(canonical, NotifyKind::Print) {
            // The print subscriber renders everyone's requests but its own
            if p_client != client {
                let txn_id = self.txns.create(
                    client,
                    p_client,
                    canonical,
                    TxnState::Print {
                        output: Vec::new(),
                        stream_attached: false,
                    },
                )?;
                let msg = NotifyMessage {
                    kind: NotifyKind::Print,
                    handle: p_handle,
                    txn_id,
                    payload: Vec::new(),
                };
                if self.send_notify(p_client, msg) {
                    self.blocked.push(BlockedEntry {
                        client,
                        reason: BlockReason::NotifyPrint,
                        handle: canonical,
                        txn_id,
                        mode: UnblockMode::PrintOutput,
                    });
                    return Ok(Outcome::Deferred);
                }
                self.txns.remove(txn_id);
                self.notify.tombstone(canonical, NotifyKind::Print, p_client);
            }
        }
        let rendered = render_value(&value, format.as_deref());
        Ok(self.reply_chunked(client, ResponseRecord::ok(), rendered.into_bytes()))
    }

    fn op_type(&mut self, handle: VarHandle) -> Result<Outcome, VarErr> {
        let var = self.store.get(handle).ok_or(VarErr::NoEnt)?;
        Ok(Outcome::Reply(
            ResponseRecord::ok().with_result1(u64::from(var.value.var_type().tag())),
        ))
    }

    fn op_name(&mut self, handle: VarHandle) -> Result<Outcome, VarErr> {
        let var = self.store.get(handle).ok_or(VarErr::NoEnt)?;
        Ok(Outcome::Reply(
            ResponseRecord::ok().with_payload(var.name.clone().into_bytes()),
        ))
    }

    fn op_length(&mut self, handle: VarHandle) -> Result<Outcome, VarErr> {
        let var = self.store.get(handle).ok_or(VarErr::NoEnt)?;
        Ok(Outcome::Reply(
            ResponseRecord::ok().with_result1(var.value.length() as u64),
        ))
    }

    fn op_flags(&mut self, handle: VarHandle) -> Result<Outcome, VarErr> {
        let var = self.store.get(handle).ok_or(VarErr::NoEnt)?;
        Ok(Outcome::Reply(
            ResponseRecord::ok().with_result1(u64::from(var.flags.bits())),
        ))
    }

    fn op_info(&mut self, client: ClientId, handle: VarHandle) -> Result<Outcome, VarErr> {
        let uid = self.client_uid(client);
        let var = self.store.get(handle).ok_or(VarErr::NoEnt)?;
        if !var.acl.can_read(uid) {
            return Err(VarErr::Access);
        }
        let info = VarInfo {
            name: var.name.clone(),
            instance_id: var.instance_id,
            value: var.value.clone(),
            flags: var.flags.bits(),
            format: var.format.clone(),
            tags: var
                .tags
                .iter()
                .filter_map(|t| self.tags.name_of(*t))
                .map(ToString::to_string)
                .collect(),
            read_acl: var.acl.read.clone(),
            write_acl: var.acl.write.clone(),
        };
        let mut payload = Vec::new();
        info.encode(&mut payload);
        if payload.len() > self.client_workbuf(client) {
            return Err(VarErr::TooBig);
        }
        Ok(Outcome::Reply(
            ResponseRecord::ok()
                .with_result1(u64::from(var.handle.id()))
                .with_payload(payload),
        ))
    }

    fn op_notify(
        &mut self,
        client: ClientId,
        handle: VarHandle,
        kind: NotifyKind,
    ) -> Result<Outcome, VarErr> {
        let canonical = self.store.canonical(handle).ok_or(VarErr::NoEnt)?;
        self.notify.register(canonical, kind, client, handle)?;
        debug!(
            client = client.id(),
            handle = handle.id(),
            kind = kind.code(),
            "subscription added"
        );
        Ok(Outcome::Reply(ResponseRecord::ok()))
    }

    fn op_notify_cancel(
        &mut self,
        client: ClientId,
        handle: VarHandle,
        kind: NotifyKind,
    ) -> Result<Outcome, VarErr> {
        let canonical = self.store.canonical(handle).ok_or(VarErr::NoEnt)?;
        self.notify.cancel(canonical, kind, client)?;
        Ok(Outcome::Reply(ResponseRecord::ok()))
    }

    fn op_get_validation_request(
        &mut self,
        client: ClientId,
        txn_id: u32,
    ) -> Result<Outcome, VarErr> {
        let txn = self.txns.get(txn_id).ok_or(VarErr::NoEnt)?;
        let TxnState::Validate { proposed } = &txn.state else {
            return Err(VarErr::NoEnt);
        };
        let payload = proposed.to_bytes();
        if payload.len() > self.client_workbuf(client) {
            return Err(VarErr::TooBig);
        }
        Ok(Outcome::Reply(
            ResponseRecord::ok()
                .with_result1(u64::from(txn.handle.id()))
                .with_txn(txn_id)
                .with_payload(payload),
        ))
    }

    fn op_send_validation_response(&mut self, txn_id: u32, code: u32) -> Result<Outcome, VarErr> {
        match self.txns.get(txn_id) {
            Some(txn) if matches!(txn.state, TxnState::Validate { .. }) => {}
            _ => return Err(VarErr::NoEnt),
        }
        let Some(txn) = self.txns.remove(txn_id) else {
            return Err(VarErr::NoEnt);
        };
        let TxnState::Validate { proposed } = txn.state else {
            return Err(VarErr::NoEnt);
        };
        if code == EOK {
            self.commit_set(txn.handle, proposed);
        }
        match self.blocked.take_by_txn(txn_id) {
            Some(entry) => {
                self.unblock(entry.client);
                let resp = if code == EOK {
                    ResponseRecord::ok()
                } else {
                    // The validator's verdict passes through verbatim
                    ResponseRecord {
                        code,
                        result1: 0,
                        result2: 0,
                        txn_id: 0,
                        payload: Vec::new(),
                    }
                };
                self.push_response(entry.client, resp);
            }
            None => warn!(txn_id, "validation response without a blocked setter"),
        }
        Ok(Outcome::Reply(ResponseRecord::ok()))
    }

    fn op_open_print_session(&mut self, txn_id: u32) -> Result<Outcome, VarErr> {
        let txn = self.txns.get(txn_id).ok_or(VarErr::NoEnt)?;
        if !matches!(txn.state, TxnState::Print { .. }) {
            return Err(VarErr::NoEnt);
        }
        Ok(Outcome::Reply(
            ResponseRecord::ok()
                .with_result1(u64::from(txn.handle.id()))
                .with_result2(u32::from(txn.requestor.id()))
                .with_txn(txn_id),
        ))
    }

    fn op_close_print_session(&mut self, txn_id: u32) -> Result<Outcome, VarErr> {
        match self.txns.get(txn_id) {
            Some(txn) if matches!(txn.state, TxnState::Print { .. }) => {}
            _ => return Err(VarErr::NoEnt),
        }
        let Some(txn) = self.txns.remove(txn_id) else {
            return Err(VarErr::NoEnt);
        };
        let TxnState::Print { output, .. } = txn.state else {
            return Err(VarErr::NoEnt);
        };
        if let Some(entry) = self.blocked.take_by_txn(txn_id) {
            self.unblock(entry.client);
            self.push_value_response(entry.client, ResponseRecord::ok(), output);
        }
        Ok(Outcome::Reply(ResponseRecord::ok()))
    }

    fn op_get_first(&mut self, client: ClientId, query: &SearchQuery) -> Result<Outcome, VarErr> {
        let uid = self.client_uid(client);
        let spec = QuerySpec::resolve(query, &self.tags);
        let handles: Vec<VarHandle> = self
            .store
            .canonical_handles()
            .into_iter()
            .filter(|h| {
                self.store
                    .get(*h)
                    .is_some_and(|var| spec.matches(var) && var.acl.can_read(uid))
            })
            .collect();
        let context = self.contexts.begin(client, handles);
        self.iteration_step(client, context)
    }

    fn op_get_next(&mut self, client: ClientId, context: u32) -> Result<Outcome, VarErr> {
        self.iteration_step(client, context)
    }

    fn op_change_flags(
        &mut self,
        handle: VarHandle,
        mask: u32,
        set: bool,
    ) -> Result<Outcome, VarErr> {
        let mask = VarFlags::from_bits_truncate(mask);
        let var = self.store.get_mut(handle).ok_or(VarErr::NoEnt)?;
        if set {
            var.flags |= mask;
        } else {
            var.flags &= !mask;
        }
        Ok(Outcome::Reply(
            ResponseRecord::ok().with_result1(u64::from(var.flags.bits())),
        ))
    }

    // ------------------------------------------------------------------
    // Orchestration
    // ------------------------------------------------------------------

    /// Commit a value: store it, fan out MODIFIED, post queued deliveries,
    /// and complete every reader parked on a calc for this variable.
    fn commit_set(&mut self, canonical: VarHandle, value: VarValue) {
        let Some(var) = self.store.get_mut(canonical) else {
            warn!(handle = canonical.id(), "commit to unknown variable");
            return;
        };
        var.value = value.clone();
        var.flags |= VarFlags::DIRTY;
        let name = var.name.clone();
        if var.flags.contains(VarFlags::AUDIT) {
            info!(variable = %name, "audited variable modified");
        }

        // MODIFIED fanout, in registration order
        let targets = self.notify.modified_targets(canonical);
        let mut dead = Vec::new();
        for (cid, requested) in targets {
            let msg = NotifyMessage {
                kind: NotifyKind::Modified,
                handle: requested,
                txn_id: 0,
                payload: Vec::new(),
            };
            if !self.send_notify(cid, msg) {
                dead.push(cid);
            }
        }
        for cid in dead {
            debug!(client = cid.id(), "modified subscriber gone; tombstoned");
            self.notify.tombstone(canonical, NotifyKind::Modified, cid);
        }

        // Queued deliveries, one pending posting per consumer
        let queue_targets = self.notify.queue_targets(canonical);
        if !queue_targets.is_empty() {
            let change = ChangeRecord {
                handle: canonical.id(),
                name,
                value: value.clone(),
            };
            match serde_json::to_vec(&change) {
                Ok(payload) => {
                    for (cid, requested) in queue_targets {
                        let msg = NotifyMessage {
                            kind: NotifyKind::ModifiedQueue,
                            handle: requested,
                            txn_id: 0,
                            payload: payload.clone(),
                        };
                        if self.send_notify(cid, msg) {
                            self.notify.mark_posted(canonical, cid);
                        } else {
                            self.notify.tombstone(canonical, NotifyKind::ModifiedQueue, cid);
                        }
                    }
                }
                Err(err) => warn!(%err, "change record serialization failed"),
            }
        }

        // One write completes every reader waiting on this calc
        let waiters = self.blocked.take_calc_waiters(canonical);
        for entry in waiters {
            self.txns.remove(entry.txn_id);
            self.unblock(entry.client);
            match entry.mode {
                UnblockMode::GetValue => {
                    self.push_value_response(entry.client, ResponseRecord::ok(), value.to_bytes());
                }
                UnblockMode::Iteration { context } => {
                    self.push_iteration_item(entry.client, context, canonical, &value);
                }
                UnblockMode::SetResult | UnblockMode::PrintOutput => {
                    warn!(client = entry.client.id(), "calc waiter with unexpected mode");
                    self.push_response(entry.client, ResponseRecord::ok());
                }
            }
        }
    }

    /// Park a reader behind the variable's calculator. `Ok(None)` means
    /// the calculator is unreachable and was tombstoned; read directly.
    fn defer_calc(
        &mut self,
        client: ClientId,
        canonical: VarHandle,
        calc_client: ClientId,
        requested: VarHandle,
        mode: UnblockMode,
    ) -> Result<Option<Outcome>, VarErr> {
        let txn_id = self
            .txns
            .create(client, calc_client, canonical, TxnState::Calc)?;
        let msg = NotifyMessage {
            kind: NotifyKind::Calc,
            handle: requested,
            txn_id,
            payload: Vec::new(),
        };
        if self.send_notify(calc_client, msg) {
            self.blocked.push(BlockedEntry {
                client,
                reason: BlockReason::NotifyCalc,
                handle: canonical,
                txn_id,
                mode,
            });
            return Ok(Some(Outcome::Deferred));
        }
        self.txns.remove(txn_id);
        self.notify.tombstone(canonical, NotifyKind::Calc, calc_client);
        debug!(client = calc_client.id(), "calc subscriber gone; tombstoned");
        Ok(None)
    }

    /// Advance an iteration, deferring via the calc flow when a matched
    /// variable is computed on demand by someone else.
    fn iteration_step(&mut self, client: ClientId, context: u32) -> Result<Outcome, VarErr> {
        let uid = self.client_uid(client);
        loop {
            let next = self
                .contexts
                .get_mut(client, context)
                .ok_or(VarErr::NoEnt)?
                .advance();
            let Some(handle) = next else {
                self.contexts.finish(client, context);
                return Err(VarErr::NoEnt);
            };
            if let Some((calc_client, requested)) =
                self.notify.exclusive(handle, NotifyKind::Calc)
            {
                if calc_client != client {
                    if let Some(outcome) = self.defer_calc(
                        client,
                        handle,
                        calc_client,
                        requested,
                        UnblockMode::Iteration { context },
                    )? {
                        return Ok(outcome);
                    }
                }
            }
            let Some(var) = self.store.get(handle) else {
                continue;
            };
            if !var.acl.can_read(uid) {
                continue;
            }
            let mut payload = Vec::new();
            encode_iteration_item(&var.name, &var.value, &mut payload);
            if payload.len() > self.client_workbuf(client) {
                debug!(handle = handle.id(), "iteration item exceeds working buffer; skipped");
                continue;
            }
            return Ok(Outcome::Reply(
                ResponseRecord::ok()
                    .with_result1(u64::from(handle.id()))
                    .with_result2(context)
                    .with_payload(payload),
            ));
        }
    }

    fn teardown_client(&mut self, client: ClientId) {
        // Its own pending request dies with it
        let _ = self.blocked.take_by_client(client);
        // Transactions it initiated evaporate
        self.txns.remove_by_requestor(client);
        // Peers waiting on it learn it is gone
        let served = self.txns.remove_by_server(client);
        for txn in served {
            if let Some(entry) = self.blocked.take_by_txn(txn.id) {
                self.unblock(entry.client);
                self.push_response(entry.client, ResponseRecord::err(VarErr::NoEnt));
            }
        }
        self.contexts.drop_client(client);
        self.notify.sweep_client(client);
        if self.clients.release(client).is_some() {
            info!(client = client.id(), "client disconnected");
        }
        self.publish_client_info();
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// Create the `/varserver/stats/*` and `/varserver/client/info`
    /// variables. They are ordinary readonly variables; the engine writes
    /// them through the commit path so subscribers see them change.
    pub fn install_stats(&mut self) {
        let total_requests =
            self.make_stat_var("/varserver/stats/total_requests", VarValue::UInt64(0));
        let rps = self.make_stat_var("/varserver/stats/rps", VarValue::UInt32(0));
        let blocked_clients =
            self.make_stat_var("/varserver/stats/blocked_clients", VarValue::UInt16(0));
        let per_op = std::array::from_fn(|i| {
            let kind = var_protocol::RequestKind::ALL[i];
            self.make_stat_var(
                &format!("/varserver/stats/op/{}", kind.name()),
                VarValue::UInt64(0),
            )
        });
        let client_info =
            self.make_stat_var("/varserver/client/info", VarValue::Str("[]".to_string()));
        self.stat_vars = Some(StatVars {
            total_requests,
            rps,
            blocked_clients,
            per_op,
            client_info,
        });
    }

    fn make_stat_var(&mut self, name: &str, value: VarValue) -> VarHandle {
        let info = VarInfo::new(name, value);
        match self.create_variable(&info, VarFlags::READONLY) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(name, %err, "statistics variable not created");
                VarHandle::INVALID
            }
        }
    }

    fn publish_client_info(&mut self) {
        let Some(handle) = self.stat_vars.as_ref().map(|s| s.client_info) else {
            return;
        };
        let entries: Vec<ClientInfoEntry> = self
            .clients
            .iter()
            .map(|c| ClientInfoEntry {
                id: c.id.id(),
                transport: c.transport.label(),
                uid: c.uid,
                blocked: c.blocked,
                requests: c.request_count,
            })
            .collect();
        match serde_json::to_string(&entries) {
            Ok(json) => self.commit_set(handle, VarValue::Str(json)),
            Err(err) => warn!(%err, "client table rendering failed"),
        }
    }

    // ------------------------------------------------------------------
    // Small helpers
    // ------------------------------------------------------------------

    fn create_variable(&mut self, info: &VarInfo, flags: VarFlags) -> Result<VarHandle, VarErr> {
        if self.index.contains(&info.name) {
            return Err(VarErr::Exist);
        }
        if self.index.is_full() || self.store.is_full() {
            return Err(VarErr::NoMem);
        }
        let mut tags = Vec::with_capacity(info.tags.len());
        for tag in &info.tags {
            tags.push(self.tags.intern(tag)?);
        }
        let handle = self.store.create(info, tags, flags)?;
        self.index.insert(&info.name, handle)?;
        Ok(handle)
    }

    fn count_op(&mut self, kind: var_protocol::RequestKind) {
        self.counters.total += 1;
        self.counters.window += 1;
        self.counters.per_op[usize::from(kind.code())] += 1;
    }

    fn client_uid(&self, client: ClientId) -> u32 {
        self.clients.get(client).map_or(u32::MAX, |c| c.uid)
    }

    fn client_workbuf(&self, client: ClientId) -> usize {
        self.clients
            .get(client)
            .map_or(crate::clients::MIN_WORKBUF, |c| c.workbuf_size)
    }

    fn unblock(&mut self, client: ClientId) {
        if let Some(record) = self.clients.get_mut(client) {
            record.blocked = false;
        }
    }

    fn send_notify(&self, to: ClientId, msg: NotifyMessage) -> bool {
        match self.clients.get(to).and_then(|c| c.notify_tx.as_ref()) {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    fn push_response(&self, client: ClientId, resp: ResponseRecord) {
        if let Some(record) = self.clients.get(client) {
            if record.response_tx.send(resp).is_err() {
                debug!(client = client.id(), "response channel gone");
            }
        }
    }

    /// Answer with a variable-length payload, chunking to the client's
    /// working buffer. Used by the deferred GET / PRINT completion paths.
    fn push_value_response(&mut self, client: ClientId, base: ResponseRecord, payload: Vec<u8>) {
        match self.chunk_payload(client, base, payload) {
            (resp, None) => self.push_response(client, resp),
            (resp, Some(parts)) => {
                self.blocked.push(BlockedEntry {
                    client,
                    reason: BlockReason::Render { parts },
                    handle: VarHandle::INVALID,
                    txn_id: 0,
                    mode: UnblockMode::GetValue,
                });
                if let Some(record) = self.clients.get_mut(client) {
                    record.blocked = true;
                }
                self.push_response(client, resp);
            }
        }
    }

    /// Same as [`Self::push_value_response`] but for the synchronous
    /// handler path, where the dispatcher pushes the first frame.
    fn reply_chunked(&mut self, client: ClientId, base: ResponseRecord, payload: Vec<u8>) -> Outcome {
        match self.chunk_payload(client, base, payload) {
            (resp, None) => Outcome::Reply(resp),
            (resp, Some(parts)) => {
                self.blocked.push(BlockedEntry {
                    client,
                    reason: BlockReason::Render { parts },
                    handle: VarHandle::INVALID,
                    txn_id: 0,
                    mode: UnblockMode::GetValue,
                });
                if let Some(record) = self.clients.get_mut(client) {
                    record.blocked = true;
                }
                Outcome::Reply(resp)
            }
        }
    }

    /// Split an oversized payload; the first frame carries the remaining
    /// byte count in `result1` so the consumer keeps reading.
    fn chunk_payload(
        &self,
        client: ClientId,
        base: ResponseRecord,
        payload: Vec<u8>,
    ) -> (ResponseRecord, Option<VecDeque<Vec<u8>>>) {
        let cap = self.client_workbuf(client);
        if payload.len() <= cap {
            return (base.with_payload(payload), None);
        }
        let mut parts: VecDeque<Vec<u8>> = payload.chunks(cap).map(<[u8]>::to_vec).collect();
        let Some(first) = parts.pop_front() else {
            return (base, None);
        };
        let remaining: usize = parts.iter().map(Vec::len).sum();
        (
            base.with_result1(remaining as u64).with_payload(first),
            Some(parts),
        )
    }

    fn push_iteration_item(
        &mut self,
        client: ClientId,
        context: u32,
        canonical: VarHandle,
        value: &VarValue,
    ) {
        let name = self
            .store
            .get(canonical)
            .map_or_else(String::new, |v| v.name.clone());
        let mut payload = Vec::new();
        encode_iteration_item(&name, value, &mut payload);
        self.push_response(
            client,
            ResponseRecord::ok()
                .with_result1(u64::from(canonical.id()))
                .with_result2(context)
                .with_payload(payload),
        );
    }
}
