//! Identifiers shared by the client session layer and the broker-side
//! resource manager.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{LumenError, LumenResult};

// ── XA flags (X/Open XA specification) ──────────────────────────────────────

/// No flags set.
pub const TMNOFLAGS: i32 = 0x0000_0000;
/// Caller is joining an existing transaction branch.
pub const TMJOIN: i32 = 0x0020_0000;
/// Caller is resuming association with a suspended branch.
pub const TMRESUME: i32 = 0x0800_0000;
/// Dissociate caller from the branch, work succeeded.
pub const TMSUCCESS: i32 = 0x0400_0000;
/// Dissociate caller from the branch, work failed.
pub const TMFAIL: i32 = 0x2000_0000;
/// Suspend (not end) the association with the branch.
pub const TMSUSPEND: i32 = 0x0200_0000;
/// Start a recovery scan.
pub const TMSTARTRSCAN: i32 = 0x0100_0000;
/// End a recovery scan.
pub const TMENDRSCAN: i32 = 0x0080_0000;
/// One-phase commit optimisation.
pub const TMONEPHASE: i32 = 0x4000_0000;

/// Human-readable name for an XA start/end flag, used in trace logs.
pub fn xa_flag_name(flags: i32) -> String {
    match flags {
        TMSUSPEND => "SESS_XA_SUSPEND".to_string(),
        TMSUCCESS => "TMSUCCESS".to_string(),
        TMFAIL => "TMFAIL".to_string(),
        TMJOIN => "TMJOIN".to_string(),
        TMRESUME => "TMRESUME".to_string(),
        TMNOFLAGS => "TMNOFLAGS".to_string(),
        other => format!("XAER_INVAL({})", other),
    }
}

// ── Xid ─────────────────────────────────────────────────────────────────────

/// XA transaction branch identifier: (format id, global transaction id,
/// branch qualifier). Immutable; used as a map key on both sides of the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid {
    format_id: i32,
    global_transaction_id: Vec<u8>,
    branch_qualifier: Vec<u8>,
}

impl Xid {
    /// Maximum length of the global transaction id.
    pub const MAXGTRIDSIZE: usize = 64;
    /// Maximum length of the branch qualifier.
    pub const MAXBQUALSIZE: usize = 64;

    pub fn new(
        format_id: i32,
        global_transaction_id: &[u8],
        branch_qualifier: &[u8],
    ) -> LumenResult<Self> {
        if global_transaction_id.len() > Self::MAXGTRIDSIZE {
            return Err(LumenError::InvalidArgument(format!(
                "global transaction id is {} bytes, max {}",
                global_transaction_id.len(),
                Self::MAXGTRIDSIZE
            )));
        }
        if branch_qualifier.len() > Self::MAXBQUALSIZE {
            return Err(LumenError::InvalidArgument(format!(
                "branch qualifier is {} bytes, max {}",
                branch_qualifier.len(),
                Self::MAXBQUALSIZE
            )));
        }
        Ok(Self {
            format_id,
            global_transaction_id: global_transaction_id.to_vec(),
            branch_qualifier: branch_qualifier.to_vec(),
        })
    }

    /// A fresh random identifier (format id 0).
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self {
            format_id: 0,
            global_transaction_id: uuid.as_bytes().to_vec(),
            branch_qualifier: vec![0u8; 8],
        }
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn global_transaction_id(&self) -> &[u8] {
        &self.global_transaction_id
    }

    pub fn branch_qualifier(&self) -> &[u8] {
        &self.branch_qualifier
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{:02x}", b)?;
    }
    Ok(())
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format_id)?;
        write_hex(f, &self.global_transaction_id)?;
        f.write_str(":")?;
        write_hex(f, &self.branch_qualifier)
    }
}

// ── Client-side identifiers ─────────────────────────────────────────────────

/// Server-assigned consumer identifier; stable across re-attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

/// Client-local producer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProducerId(pub u64);

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "producer-{}", self.0)
    }
}

/// Broker-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
