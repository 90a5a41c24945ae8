//! Wire request codes and payload encodings for TS↔PS traffic.
//!
//! Request codes travel as little-endian 32-bit integers inside the frame
//! header (see [`conn`](crate::conn)).  Structured payloads are bincode;
//! the single-integer payloads (connection type, boot info, MVCCID) are
//! plain little-endian bytes.

use {
    crate::{
        error::{Result, TranServerError},
        lsa::Lsa,
    },
    serde::{Deserialize, Serialize},
    std::{fmt, hash::Hash},
};

/// A request code that can cross the wire as an `i32`.
pub trait RequestCode: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    fn to_wire(self) -> i32;
    fn from_wire(raw: i32) -> Option<Self>;
}

/// Requests sent from the transaction server to a page server.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranToPageRequest {
    /// Fetch boot metadata; the answer carries the sentinel volume count.
    GetBootInfo = 0,
    /// Fetch the oldest MVCCID still visible to any active transaction.
    GetOldestActiveMvccid = 1,
    /// Final message of a graceful disconnect; payload is the connection
    /// type as 4 little-endian bytes.  Nothing may follow it.
    SendDisconnectMsg = 2,
    /// Ask a freshly connected page server to catch up; payload is a
    /// packed [`CatchUpRequest`].
    SendStartCatchUp = 3,
    /// One batch of appended log records from the prior sender.
    SendLogPriorList = 4,
    /// Response to a page-server originated request.
    Respond = 5,
}

/// Requests sent from a page server to the transaction server.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageToTranRequest {
    /// The highest LSA the page server has durably saved; payload is a
    /// bincode [`Lsa`].
    SendSavedLsa = 0,
    /// The catchup requested at connect time has finished.
    SendCatchupComplete = 1,
    /// The page server asks the transaction server to disconnect.
    SendDisconnectRequestMsg = 2,
    /// Response to a transaction-server originated request.
    Respond = 3,
}

impl RequestCode for TranToPageRequest {
    fn to_wire(self) -> i32 {
        self as i32
    }

    fn from_wire(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::GetBootInfo),
            1 => Some(Self::GetOldestActiveMvccid),
            2 => Some(Self::SendDisconnectMsg),
            3 => Some(Self::SendStartCatchUp),
            4 => Some(Self::SendLogPriorList),
            5 => Some(Self::Respond),
            _ => None,
        }
    }
}

impl RequestCode for PageToTranRequest {
    fn to_wire(self) -> i32 {
        self as i32
    }

    fn from_wire(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::SendSavedLsa),
            1 => Some(Self::SendCatchupComplete),
            2 => Some(Self::SendDisconnectRequestMsg),
            3 => Some(Self::Respond),
            _ => None,
        }
    }
}

// ── Catchup payload ─────────────────────────────────────────────────────────

/// Payload of [`TranToPageRequest::SendStartCatchUp`]: where to catch up
/// from and up to which LSA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchUpRequest {
    /// Host of the current main connection, `"N/A"` during initial boot.
    pub host: String,
    /// Port of the current main connection, `-1` during initial boot.
    pub port: i32,
    /// First LSA the prior sender has not yet streamed to this peer.
    pub catchup_lsa: Lsa,
}

impl CatchUpRequest {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| TranServerError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| TranServerError::Serialization(e.to_string()))
    }
}

// ── Scalar payloads ─────────────────────────────────────────────────────────

/// Multi-version concurrency control transaction id.
pub type MvccId = u64;

/// No MVCCID; returned when the page server could not be asked.
pub const MVCCID_NULL: MvccId = 0;
/// Everything is visible; sent while the page server waits for a passive
/// transaction server that has not yet reported its own value.
pub const MVCCID_ALL_VISIBLE: MvccId = 3;
/// First MVCCID ever assigned to a transaction.
pub const MVCCID_FIRST: MvccId = 4;

/// Count of permanent volumes, as reported by `GET_BOOT_INFO`.
pub type DkNVols = i32;

/// Sentinel volume count echoed by the page server so the transaction
/// server can verify the boot-info round trip.
pub const VOLID_MAX: DkNVols = 0x7fff;

pub fn encode_lsa(lsa: &Lsa) -> Result<Vec<u8>> {
    bincode::serialize(lsa).map_err(|e| TranServerError::Serialization(e.to_string()))
}

pub fn decode_lsa(bytes: &[u8]) -> Result<Lsa> {
    bincode::deserialize(bytes).map_err(|e| TranServerError::Serialization(e.to_string()))
}

pub fn encode_mvccid(id: MvccId) -> Vec<u8> {
    id.to_le_bytes().to_vec()
}

pub fn decode_mvccid(bytes: &[u8]) -> Result<MvccId> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| TranServerError::Serialization("mvccid payload is not 8 bytes".into()))?;
    Ok(MvccId::from_le_bytes(raw))
}

pub fn encode_boot_info() -> Vec<u8> {
    VOLID_MAX.to_le_bytes().to_vec()
}

pub fn decode_boot_info(bytes: &[u8]) -> Result<DkNVols> {
    let raw: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| TranServerError::Serialization("boot info payload is short".into()))?;
    Ok(DkNVols::from_le_bytes(raw))
}

// ── Tests ───────────────────────────────────────────────────────────────────
