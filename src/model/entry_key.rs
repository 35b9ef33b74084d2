use serde::{Deserialize, Serialize};

/// Seven-character pairing code (`^[0-9]{3}[A-Z]{4}$`) binding an unowned
/// device to a user account. At most one active code per serial; expired and
/// unclaimed codes may be reused, claimed codes are terminal.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EntryKey {
    pub code: String,
    pub serial: String,
    pub created_at: i64,
    /// Milliseconds since epoch, never seconds — see the design note on
    /// rejecting implausibly small values in `pairing::EntryKey::is_expired`.
    pub expires_at: i64,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
}

/// A millisecond epoch this small would expire the code in 1970 if
/// `expires_at` were genuinely milliseconds — a value below this bound is
/// almost certainly a second-scale timestamp written by a buggy caller.
/// Treated as already expired so lookups fail closed instead of honoring a
/// malformed row.
const PLAUSIBLE_MS_FLOOR: i64 = 10_000_000_000; // ~2001-09-09 in ms, ~2286 in s

impl EntryKey {
    pub fn looks_like_seconds(expires_at: i64) -> bool {
        expires_at > 0 && expires_at < PLAUSIBLE_MS_FLOOR
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        if Self::looks_like_seconds(self.expires_at) {
            return true;
        }
        now_ms >= self.expires_at
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed_by.is_some()
    }

    pub fn matches_format(code: &str) -> bool {
        let bytes = code.as_bytes();
        bytes.len() == 7
            && bytes[..3].iter().all(|b| b.is_ascii_digit())
            && bytes[3..].iter().all(|b| b.is_ascii_uppercase())
    }
}
