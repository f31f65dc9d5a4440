//! Notification events as delivered on a client's NOTIFY channel.
//!
//! Events ride in response-record frames: `result1` is the handle the
//! subscriber originally asked for, `result2` the notification kind,
//! `txn_id` the transaction for calc/validate/print events, and the
//! payload carries the serialized change record for queued deliveries.

use serde::{Deserialize, Serialize};

use crate::err::WireError;
use crate::handle::VarHandle;
use crate::kinds::NotifyKind;
use crate::record::ResponseRecord;
use crate::value::VarValue;

/// One event on the NOTIFY channel.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyMessage {
    pub kind: NotifyKind,
    /// The handle as the subscriber requested it (alias-preserving).
    pub handle: VarHandle,
    /// Transaction to answer, for CALC / VALIDATE / PRINT.
    pub txn_id: u32,
    /// Serialized [`ChangeRecord`], for MODIFIED_QUEUE.
    pub payload: Vec<u8>,
}

impl NotifyMessage {
    #[must_use]
    pub fn to_record(&self) -> ResponseRecord {
        ResponseRecord::ok()
            .with_result1(u64::from(self.handle.id()))
            .with_result2(self.kind.code())
            .with_txn(self.txn_id)
            .with_payload(self.payload.clone())
    }

    pub fn from_record(record: &ResponseRecord) -> Result<NotifyMessage, WireError> {
        let kind = NotifyKind::from_code(record.result2)
            .ok_or(WireError::BadPayload("notification kind"))?;
        Ok(NotifyMessage {
            kind,
            handle: VarHandle::new(record.result1 as u32),
            txn_id: record.txn_id,
            payload: record.payload.clone(),
        })
    }
}

/// The queued-delivery payload: what changed and to what.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub handle: u32,
    pub name: String,
    pub value: VarValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_message_round_trips() {
        let msg = NotifyMessage {
            kind: NotifyKind::Validate,
            handle: VarHandle::new(9),
            txn_id: 4,
            payload: Vec::new(),
        };
        let parsed = NotifyMessage::from_record(&msg.to_record()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn change_record_serializes_to_json() {
        let change = ChangeRecord {
            handle: 3,
            name: "/a".to_string(),
            value: VarValue::Int32(7),
        };
        let json = serde_json::to_string(&change).unwrap();
        let back: ChangeRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, change);
    }
}
