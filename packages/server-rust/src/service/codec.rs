//! Binary encoding of operations and response envelopes.
//!
//! Layout of an encoded operation:
//!
//! ```text
//! u16 factory_id | u16 class_id | u32 partition_id | u64 call_timeout_ms | kind fields...
//! ```
//!
//! Kind fields are written in a fixed per-kind order. Strings are a `u32`
//! byte length followed by UTF-8; values are a `u32` length followed by
//! `MsgPack`; optional values are prefixed by a presence byte. Call id,
//! attempt and caller travel on the packet, not in the operation bytes.
//!
//! Decoding looks up the kind in a table built once per node, so an unknown
//! `(factory_id, class_id)` pair is rejected before any payload is read.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use relaygrid_core::{Value, ValueError};

use super::operation::{
    BackupAckTarget, CallerUpdatePayload, EntryPayload, FlushPayload, KeyPayload, KindId,
    Operation, OperationContext, OperationKind, OperationResponse, RemoteFailure,
    ReplicationPayload, ResponseEnvelope,
};

/// Errors raised while encoding or decoding.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unknown operation kind {factory_id}:{class_id}")]
    UnknownKind { factory_id: u16, class_id: u16 },
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("invalid tag {tag} for {field}")]
    InvalidTag { field: &'static str, tag: u8 },
    #[error("field too large: {len} bytes")]
    TooLarge { len: usize },
    #[error(transparent)]
    Value(#[from] ValueError),
}

type DecodeFn = fn(&mut Bytes, OperationContext) -> Result<Operation, CodecError>;

/// Encodes operations and decodes them through a kind-id table.
pub struct OperationCodec {
    decoders: HashMap<KindId, DecodeFn>,
}

impl Default for OperationCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationCodec {
    /// Builds the decode table for every known kind.
    #[must_use]
    pub fn new() -> Self {
        let mut decoders: HashMap<KindId, DecodeFn> = HashMap::new();
        for kind in OperationKind::ALL {
            decoders.insert(kind.id(), decoder_for(kind));
        }
        Self { decoders }
    }

    #[must_use]
    pub fn knows(&self, id: KindId) -> bool {
        self.decoders.contains_key(&id)
    }

    /// Encodes `op`. `call_id`, `attempt` and `caller` are not part of the output.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Value`] if a value cannot be serialized and
    /// [`CodecError::TooLarge`] for fields over `u32::MAX` bytes.
    pub fn encode(&self, op: &Operation) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(64);
        let id = op.kind().id();
        let ctx = op.ctx();
        buf.put_u16(id.factory_id);
        buf.put_u16(id.class_id);
        buf.put_u32(ctx.partition_id);
        buf.put_u64(ctx.call_timeout_ms);

        match op {
            Operation::Put { entry, .. } | Operation::MapPut { entry, .. } => {
                put_entry(&mut buf, entry)?;
            }
            Operation::Get { target, .. } | Operation::Remove { target, .. } => {
                put_str(&mut buf, &target.name)?;
                put_str(&mut buf, &target.key)?;
            }
            Operation::Replicate { record, .. } => put_record(&mut buf, record)?,
            Operation::UpdateCaller { update, .. } => {
                put_record(&mut buf, &update.record)?;
                put_opt_value(&mut buf, update.old_value.as_ref())?;
                buf.put_u64(update.origin_call_id);
            }
            Operation::MapBackup { entry, ack, .. } => {
                put_entry(&mut buf, entry)?;
                match ack {
                    Some(ack) => {
                        buf.put_u8(1);
                        put_str(&mut buf, &ack.node_id)?;
                        buf.put_u64(ack.call_id);
                        buf.put_u32(ack.attempt);
                    }
                    None => buf.put_u8(0),
                }
            }
            Operation::Flush { flush, .. } => {
                put_str(&mut buf, &flush.name)?;
                buf.put_u8(u8::from(flush.flush_all));
            }
        }
        Ok(buf.freeze())
    }

    /// Decodes an operation. The returned context has `call_id == 0` and an
    /// empty caller; the receiver restores both from the packet.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownKind`] for unregistered kind ids and a
    /// field-level error for malformed payloads.
    pub fn decode(&self, mut bytes: Bytes) -> Result<Operation, CodecError> {
        ensure(&bytes, 16)?;
        let id = KindId::new(bytes.get_u16(), bytes.get_u16());
        let decode = self.decoders.get(&id).ok_or(CodecError::UnknownKind {
            factory_id: id.factory_id,
            class_id: id.class_id,
        })?;
        let partition_id = bytes.get_u32();
        let call_timeout_ms = bytes.get_u64();
        decode(&mut bytes, OperationContext::new(partition_id, call_timeout_ms))
    }

    /// Encodes a response envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Value`] if a carried value cannot be serialized.
    pub fn encode_response(envelope: &ResponseEnvelope) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u32(envelope.backup_acks);
        match &envelope.outcome {
            Ok(response) => {
                buf.put_u8(0);
                put_response(&mut buf, response)?;
            }
            Err(failure) => {
                buf.put_u8(1);
                match failure {
                    RemoteFailure::WrongTarget { partition_id } => {
                        buf.put_u8(0);
                        buf.put_u32(*partition_id);
                    }
                    RemoteFailure::Overloaded { partition_id } => {
                        buf.put_u8(4);
                        buf.put_u32(*partition_id);
                    }
                    RemoteFailure::Application { message } => {
                        buf.put_u8(1);
                        put_str(&mut buf, message)?;
                    }
                    RemoteFailure::Codec { message } => {
                        buf.put_u8(2);
                        put_str(&mut buf, message)?;
                    }
                    RemoteFailure::Internal { message } => {
                        buf.put_u8(3);
                        put_str(&mut buf, message)?;
                    }
                }
            }
        }
        Ok(buf.freeze())
    }

    /// Decodes a response envelope.
    ///
    /// # Errors
    ///
    /// Returns a field-level [`CodecError`] for malformed input.
    pub fn decode_response(mut bytes: Bytes) -> Result<ResponseEnvelope, CodecError> {
        ensure(&bytes, 5)?;
        let backup_acks = bytes.get_u32();
        let outcome = match bytes.get_u8() {
            0 => Ok(get_response(&mut bytes)?),
            1 => Err(match get_u8(&mut bytes)? {
                0 => RemoteFailure::WrongTarget {
                    partition_id: get_u32(&mut bytes)?,
                },
                1 => RemoteFailure::Application {
                    message: get_string(&mut bytes)?,
                },
                2 => RemoteFailure::Codec {
                    message: get_string(&mut bytes)?,
                },
                3 => RemoteFailure::Internal {
                    message: get_string(&mut bytes)?,
                },
                4 => RemoteFailure::Overloaded {
                    partition_id: get_u32(&mut bytes)?,
                },
                tag => return Err(CodecError::InvalidTag { field: "failure", tag }),
            }),
            tag => return Err(CodecError::InvalidTag { field: "outcome", tag }),
        };
        Ok(ResponseEnvelope {
            backup_acks,
            outcome,
        })
    }
}

// ---------------------------------------------------------------------------
// Per-kind decoders
// ---------------------------------------------------------------------------

fn decoder_for(kind: OperationKind) -> DecodeFn {
    match kind {
        OperationKind::Put => decode_put,
        OperationKind::Get => decode_get,
        OperationKind::Remove => decode_remove,
        OperationKind::Replicate => decode_replicate,
        OperationKind::UpdateCaller => decode_update_caller,
        OperationKind::MapPut => decode_map_put,
        OperationKind::MapBackup => decode_map_backup,
        OperationKind::Flush => decode_flush,
    }
}

fn decode_put(buf: &mut Bytes, ctx: OperationContext) -> Result<Operation, CodecError> {
    Ok(Operation::Put {
        ctx,
        entry: get_entry(buf)?,
    })
}

fn decode_get(buf: &mut Bytes, ctx: OperationContext) -> Result<Operation, CodecError> {
    Ok(Operation::Get {
        ctx,
        target: get_key(buf)?,
    })
}

fn decode_remove(buf: &mut Bytes, ctx: OperationContext) -> Result<Operation, CodecError> {
    Ok(Operation::Remove {
        ctx,
        target: get_key(buf)?,
    })
}

fn decode_replicate(buf: &mut Bytes, ctx: OperationContext) -> Result<Operation, CodecError> {
    Ok(Operation::Replicate {
        ctx,
        record: get_record(buf)?,
    })
}

fn decode_update_caller(buf: &mut Bytes, ctx: OperationContext) -> Result<Operation, CodecError> {
    let record = get_record(buf)?;
    let old_value = get_opt_value(buf)?;
    let origin_call_id = get_u64(buf)?;
    Ok(Operation::UpdateCaller {
        ctx,
        update: CallerUpdatePayload {
            record,
            old_value,
            origin_call_id,
        },
    })
}

fn decode_map_put(buf: &mut Bytes, ctx: OperationContext) -> Result<Operation, CodecError> {
    Ok(Operation::MapPut {
        ctx,
        entry: get_entry(buf)?,
    })
}

fn decode_map_backup(buf: &mut Bytes, ctx: OperationContext) -> Result<Operation, CodecError> {
    let entry = get_entry(buf)?;
    let ack = if get_flag(buf, "ack")? {
        Some(BackupAckTarget {
            node_id: get_string(buf)?,
            call_id: get_u64(buf)?,
            attempt: get_u32(buf)?,
        })
    } else {
        None
    };
    Ok(Operation::MapBackup { ctx, entry, ack })
}

fn decode_flush(buf: &mut Bytes, ctx: OperationContext) -> Result<Operation, CodecError> {
    let name = get_string(buf)?;
    let flush_all = get_flag(buf, "flush_all")?;
    Ok(Operation::Flush {
        ctx,
        flush: FlushPayload { name, flush_all },
    })
}

// ---------------------------------------------------------------------------
// Field writers
// ---------------------------------------------------------------------------

fn put_len(buf: &mut BytesMut, len: usize) -> Result<(), CodecError> {
    let len32 = u32::try_from(len).map_err(|_| CodecError::TooLarge { len })?;
    buf.put_u32(len32);
    Ok(())
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), CodecError> {
    put_len(buf, s.len())?;
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_value(buf: &mut BytesMut, value: &Value) -> Result<(), CodecError> {
    let encoded = value.to_msgpack()?;
    put_len(buf, encoded.len())?;
    buf.put_slice(&encoded);
    Ok(())
}

fn put_opt_value(buf: &mut BytesMut, value: Option<&Value>) -> Result<(), CodecError> {
    match value {
        Some(v) => {
            buf.put_u8(1);
            put_value(buf, v)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

fn put_entry(buf: &mut BytesMut, entry: &EntryPayload) -> Result<(), CodecError> {
    put_str(buf, &entry.name)?;
    put_str(buf, &entry.key)?;
    put_value(buf, &entry.value)?;
    buf.put_i64(entry.ttl_millis);
    Ok(())
}

fn put_record(buf: &mut BytesMut, record: &ReplicationPayload) -> Result<(), CodecError> {
    put_str(buf, &record.name)?;
    put_str(buf, &record.key)?;
    put_opt_value(buf, record.value.as_ref())?;
    buf.put_u64(record.version);
    buf.put_i64(record.ttl_millis);
    Ok(())
}

fn put_response(buf: &mut BytesMut, response: &OperationResponse) -> Result<(), CodecError> {
    match response {
        OperationResponse::Empty => buf.put_u8(0),
        OperationResponse::Bool(b) => {
            buf.put_u8(1);
            buf.put_u8(u8::from(*b));
        }
        OperationResponse::Versioned { old_value, version } => {
            buf.put_u8(2);
            put_opt_value(buf, old_value.as_ref())?;
            buf.put_u64(*version);
        }
        OperationResponse::Value(value) => {
            buf.put_u8(3);
            put_opt_value(buf, value.as_ref())?;
        }
        // Flattened before encoding; encode the inner response if one slips through.
        OperationResponse::AwaitBackups { response, .. } => put_response(buf, response)?,
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Field readers
// ---------------------------------------------------------------------------

fn ensure(buf: &Bytes, needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes) -> Result<u8, CodecError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, CodecError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_i64(buf: &mut Bytes) -> Result<i64, CodecError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

fn get_flag(buf: &mut Bytes, field: &'static str) -> Result<bool, CodecError> {
    match get_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        tag => Err(CodecError::InvalidTag { field, tag }),
    }
}

fn get_chunk(buf: &mut Bytes) -> Result<Bytes, CodecError> {
    let len = get_u32(buf)? as usize;
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

fn get_string(buf: &mut Bytes) -> Result<String, CodecError> {
    let chunk = get_chunk(buf)?;
    String::from_utf8(chunk.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

fn get_value(buf: &mut Bytes) -> Result<Value, CodecError> {
    let chunk = get_chunk(buf)?;
    Ok(Value::from_msgpack(&chunk)?)
}

fn get_opt_value(buf: &mut Bytes) -> Result<Option<Value>, CodecError> {
    if get_flag(buf, "value presence")? {
        Ok(Some(get_value(buf)?))
    } else {
        Ok(None)
    }
}

fn get_key(buf: &mut Bytes) -> Result<KeyPayload, CodecError> {
    Ok(KeyPayload {
        name: get_string(buf)?,
        key: get_string(buf)?,
    })
}

fn get_entry(buf: &mut Bytes) -> Result<EntryPayload, CodecError> {
    Ok(EntryPayload {
        name: get_string(buf)?,
        key: get_string(buf)?,
        value: get_value(buf)?,
        ttl_millis: get_i64(buf)?,
    })
}

fn get_record(buf: &mut Bytes) -> Result<ReplicationPayload, CodecError> {
    Ok(ReplicationPayload {
        name: get_string(buf)?,
        key: get_string(buf)?,
        value: get_opt_value(buf)?,
        version: get_u64(buf)?,
        ttl_millis: get_i64(buf)?,
    })
}

fn get_response(buf: &mut Bytes) -> Result<OperationResponse, CodecError> {
    match get_u8(buf)? {
        0 => Ok(OperationResponse::Empty),
        1 => Ok(OperationResponse::Bool(get_flag(buf, "bool")?)),
        2 => {
            let old_value = get_opt_value(buf)?;
            let version = get_u64(buf)?;
            Ok(OperationResponse::Versioned { old_value, version })
        }
        3 => Ok(OperationResponse::Value(get_opt_value(buf)?)),
        tag => Err(CodecError::InvalidTag {
            field: "response",
            tag,
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
