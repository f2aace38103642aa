//! Wire codec for the P2P sync protocol (component C1).
//!
//! Wire format per message:
//!   [4 bytes big-endian length][CBOR-encoded envelope]
//!
//! The envelope is encoded as `{namespace_id, page_id, body}` with `body`
//! kept as a nested CBOR blob rather than inlined, so a caller that only
//! needs to route the datagram (the user and namespace communicators, C4/C5)
//! can decode the envelope header without paying to parse — or trusting —
//! the inner request/response payload. [`decode_header`] does exactly that;
//! [`decode_body`] performs the second, full decode once the datagram has
//! reached the page communicator that actually owns the page.
//!
//! All length fields are bounds-checked against [`MAX_ENVELOPE_BYTES`] before
//! any allocation happens — peers are only user-authenticated, not trusted,
//! so a hostile peer must not be able to force an unbounded allocation or a
//! panic out of the decode path.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::ids::{CommitId, Generation, NamespaceId, ObjectId, PageId};

/// Maximum encoded envelope size. Generous enough for a batch of commits,
/// small enough that a malicious peer cannot force large allocations.
pub const MAX_ENVELOPE_BYTES: usize = 8 * 1024 * 1024;

// ── Wire types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitEntry {
    pub id: CommitId,
    pub bytes: Vec<u8>,
    pub generation: Generation,
    /// Required by the batch assembler, which examines a commit's parents
    /// to find missing ones, and by the data model, which defines a commit
    /// as carrying its parent set. Carried on the wire alongside the opaque
    /// payload rather than parsed out of `bytes`, since parsing the payload
    /// format is a storage-engine concern this crate doesn't have.
    pub parents: Vec<CommitId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    WatchStart,
    WatchStop,
    CommitRequest { ids: Vec<CommitId> },
    ObjectRequest { id: ObjectId },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ObjectResponseBody {
    Present { bytes: Vec<u8>, is_synced_to_peer: bool },
    NotFound,
    MissingReference,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    WatchStartAck { has_page: bool },
    Commits { commits: Vec<CommitEntry> },
    /// `None` means the responder does not have this commit. The present
    /// case carries the same `(bytes, generation, parents)` shape as
    /// [`CommitEntry`] — whatever satisfies a missing parent must itself be
    /// inspectable for its own parents, so the batch assembler can keep
    /// walking the graph.
    CommitResponse { commits: Vec<(CommitId, Option<(Vec<u8>, Generation, Vec<CommitId>)>)> },
    /// Carries the requested `ObjectId` back — required so a responder's
    /// reply can be correlated with the pending request that triggered it
    /// when several are outstanding against the same peer at once — see
    /// [`crate::page::pending_object`].
    ObjectResponse { id: ObjectId, body: ObjectResponseBody },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Request(Request),
    Response(Response),
}

/// Parsed envelope: the demux key (namespace/page) plus the decoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub namespace_id: NamespaceId,
    pub page_id: PageId,
    pub body: MessageBody,
}

/// Wire representation. `body` is kept as an opaque, already-CBOR-encoded
/// blob so [`decode_header`] never has to understand it.
#[derive(Serialize, Deserialize)]
struct EnvelopeWire {
    namespace_id: Vec<u8>,
    page_id: Vec<u8>,
    body: Vec<u8>,
}

// ── Low-level CBOR + framing helpers ──────────────────────────────────────

pub(crate) fn cbor_encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SyncError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| SyncError::Malformed(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn cbor_decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, SyncError> {
    ciborium::from_reader(bytes).map_err(|e| SyncError::Malformed(e.to_string()))
}

pub(crate) fn frame(payload: &[u8]) -> Result<Vec<u8>, SyncError> {
    if payload.len() > MAX_ENVELOPE_BYTES {
        return Err(SyncError::Malformed("envelope too large to send".into()));
    }
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Strip the length prefix, validating it against the buffer and the size
/// cap before returning the payload slice. Never trusts the prefix alone.
pub(crate) fn unframe(bytes: &[u8]) -> Result<&[u8], SyncError> {
    if bytes.len() < 4 {
        return Err(SyncError::Malformed("datagram shorter than length prefix".into()));
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_ENVELOPE_BYTES {
        return Err(SyncError::Malformed("declared length exceeds maximum envelope size".into()));
    }
    let rest = &bytes[4..];
    if rest.len() != len {
        return Err(SyncError::Malformed("declared length does not match datagram size".into()));
    }
    Ok(rest)
}

// ── Public encode/decode ──────────────────────────────────────────────────

/// Encode a full envelope (header + body) into a framed datagram, ready to
/// hand to [`crate::transport::MeshTransport::send`].
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, SyncError> {
    let body = cbor_encode(&envelope.body)?;
    let wire = EnvelopeWire {
        namespace_id: envelope.namespace_id.as_bytes().to_vec(),
        page_id: envelope.page_id.as_bytes().to_vec(),
        body,
    };
    frame(&cbor_encode(&wire)?)
}

/// Decode only enough of a datagram to learn its destination namespace and
/// page. Returns the still-encoded body so the caller can hand it, unparsed,
/// to whichever page communicator owns `page_id` — that communicator calls
/// [`decode_body`] itself. This is the boundary the codec's trust model
/// hinges on: no reference into `bytes` outlives this call, since every
/// field is copied out during CBOR decode.
pub fn decode_header(bytes: &[u8]) -> Result<(NamespaceId, PageId, Vec<u8>), SyncError> {
    let payload = unframe(bytes)?;
    let wire: EnvelopeWire = cbor_decode(payload)?;
    Ok((NamespaceId::new(wire.namespace_id), PageId::new(wire.page_id), wire.body))
}

/// Decode the body blob returned by [`decode_header`] into a [`MessageBody`].
pub fn decode_body(body: &[u8]) -> Result<MessageBody, SyncError> {
    cbor_decode(body)
}

/// Decode a full datagram in one call (header + body). Convenience wrapper
/// around [`decode_header`] + [`decode_body`] for callers that don't need to
/// split routing from parsing (mainly tests).
pub fn decode(bytes: &[u8]) -> Result<Envelope, SyncError> {
    let (namespace_id, page_id, body) = decode_header(bytes)?;
    let body = decode_body(&body)?;
    Ok(Envelope { namespace_id, page_id, body })
}
