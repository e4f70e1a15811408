//! Little-endian wire codecs for the validator's external messages.
//!
//! The byte layouts are normative: a commit-intent or peer SSN-info message
//! produced here decodes to an identical value on any shard.

use crate::data_store::tuple_store::SsnMeta;
use crate::errors::{Result, ServalError};
use crate::tx_entry::{TupleRef, TxEntry, TxState};

/// Sequential writer over a growable buffer.
pub struct OutMemStream {
    buf: Vec<u8>,
}

impl OutMemStream {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for OutMemStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Sequential reader over a borrowed buffer. Every read checks the
/// remaining length instead of trusting the peer's framing.
pub struct InMemStream<'a> {
    buf: &'a [u8],
}

impl<'a> InMemStream<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(ServalError::WireDecode(format!(
                "need {n} bytes, {} left",
                self.buf.len()
            )));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

fn write_meta(out: &mut OutMemStream, meta: &SsnMeta) {
    out.write_u64(meta.c_stamp);
    out.write_u64(meta.p_stamp);
    out.write_u64(meta.s_stamp);
    out.write_u64(meta.p_stamp_prev);
    out.write_u64(meta.s_stamp_prev);
}

fn read_meta(inp: &mut InMemStream<'_>) -> Result<SsnMeta> {
    Ok(SsnMeta {
        c_stamp: inp.read_u64()?,
        p_stamp: inp.read_u64()?,
        s_stamp: inp.read_u64()?,
        p_stamp_prev: inp.read_u64()?,
        s_stamp_prev: inp.read_u64()?,
    })
}

/// Encodes a commit-intent intake message.
pub fn encode_commit_intent(tx: &TxEntry) -> Vec<u8> {
    let mut out = OutMemStream::new();
    out.write_u64(tx.cts());
    out.write_u64(tx.sender_peer_id);
    out.write_u32(tx.read_set.len() as u32);
    out.write_u32(tx.write_set.len() as u32);
    out.write_u32(tx.shard_set.len() as u32);
    for r in &tx.read_set {
        out.write_u32(r.key.len() as u32);
        out.write_bytes(&r.key);
        write_meta(&mut out, &r.meta);
    }
    for w in &tx.write_set {
        out.write_u32(w.key.len() as u32);
        out.write_bytes(&w.key);
        out.write_u32(w.value.len() as u32);
        out.write_bytes(&w.value);
        write_meta(&mut out, &w.meta);
    }
    for shard in &tx.shard_set {
        out.write_u64(*shard);
    }
    out.into_inner()
}

/// Decodes a commit-intent intake message into a fresh entry.
pub fn decode_commit_intent(buf: &[u8]) -> Result<TxEntry> {
    let mut inp = InMemStream::new(buf);
    let cts = inp.read_u64()?;
    let sender_peer_id = inp.read_u64()?;
    let read_len = inp.read_u32()? as usize;
    let write_len = inp.read_u32()? as usize;
    let shard_len = inp.read_u32()? as usize;

    let mut read_set = Vec::with_capacity(read_len.min(4096));
    for _ in 0..read_len {
        let key_len = inp.read_u32()? as usize;
        let key = inp.read_bytes(key_len)?.to_vec();
        let meta = read_meta(&mut inp)?;
        read_set.push(TupleRef {
            key,
            value: Vec::new(),
            meta,
        });
    }
    let mut write_set = Vec::with_capacity(write_len.min(4096));
    for _ in 0..write_len {
        let key_len = inp.read_u32()? as usize;
        let key = inp.read_bytes(key_len)?.to_vec();
        let value_len = inp.read_u32()? as usize;
        let value = inp.read_bytes(value_len)?.to_vec();
        let meta = read_meta(&mut inp)?;
        write_set.push(TupleRef { key, value, meta });
    }
    let mut shard_set = Vec::with_capacity(shard_len.min(4096));
    for _ in 0..shard_len {
        shard_set.push(inp.read_u64()?);
    }

    let tx = TxEntry::new(read_set, write_set, shard_set, sender_peer_id);
    tx.set_cts(cts);
    Ok(tx)
}

/// SSN partial exchanged between the shards of one cross-shard transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSsnInfo {
    pub cts: u64,
    pub pstamp: u64,
    pub sstamp: u64,
    pub sender_peer_id: u64,
    pub tx_state: TxState,
}

impl PeerSsnInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = OutMemStream::new();
        out.write_u64(self.cts);
        out.write_u64(self.pstamp);
        out.write_u64(self.sstamp);
        out.write_u64(self.sender_peer_id);
        out.write_u8(self.tx_state as u8);
        out.into_inner()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut inp = InMemStream::new(buf);
        let cts = inp.read_u64()?;
        let pstamp = inp.read_u64()?;
        let sstamp = inp.read_u64()?;
        let sender_peer_id = inp.read_u64()?;
        let raw_state = inp.read_u8()?;
        let tx_state = TxState::from_u8(raw_state)
            .ok_or_else(|| ServalError::WireDecode(format!("bad tx state {raw_state}")))?;
        Ok(Self {
            cts,
            pstamp,
            sstamp,
            sender_peer_id,
            tx_state,
        })
    }
}
