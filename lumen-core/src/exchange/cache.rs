//! Replay cache for server-originated requests.
//!
//! CoAP deduplication: when a server retransmits a request we already
//! answered, the stored reply is re-emitted byte-identical and the handler
//! is not run again. The cache is one "recent" slot (the reply to the
//! newest request) plus a few "non-recent" slots; duplicates of non-recent
//! requests are dropped without a reply.

use lumen_coap::{MsgId, Token};
use std::time::Instant;

/// Non-recent slots kept besides the designated recent one.
pub const DEFAULT_NON_RECENT_SLOTS: usize = 3;

/// Identity of a server request: its message id and token together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheKey {
    pub msg_id: MsgId,
    pub token: Token,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    key: CacheKey,
    reply: Vec<u8>,
    expiry: Instant,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CacheLookup<'a> {
    /// The duplicate repeats the newest request: replay these bytes and
    /// skip the handler.
    HitRecent(&'a [u8]),
    /// The duplicate repeats an older request: drop it silently.
    HitNonRecent,
    Miss,
}

#[derive(Debug, Default)]
pub struct ResponseCache {
    recent: Option<CacheEntry>,
    older: Vec<Option<CacheEntry>>,
}

impl ResponseCache {
    pub fn new(non_recent_slots: usize) -> ResponseCache {
        ResponseCache {
            recent: None,
            older: (0..non_recent_slots).map(|_| None).collect(),
        }
    }

    pub fn lookup(&self, key: &CacheKey, now: Instant) -> CacheLookup<'_> {
        if let Some(entry) = &self.recent {
            if entry.key == *key && entry.expiry > now {
                return CacheLookup::HitRecent(&entry.reply);
            }
        }
        let live_hit = self
            .older
            .iter()
            .flatten()
            .any(|entry| entry.key == *key && entry.expiry > now);
        if live_hit {
            CacheLookup::HitNonRecent
        } else {
            CacheLookup::Miss
        }
    }

    /// Stores the reply to the newest server request. The previous recent
    /// entry is demoted into the non-recent slots: an expired slot is
    /// reused first, otherwise the slot with the earliest expiry is
    /// overwritten.
    pub fn insert(&mut self, key: CacheKey, reply: Vec<u8>, expiry: Instant, now: Instant) {
        let entry = CacheEntry { key, reply, expiry };
        let demoted = match self.recent.replace(entry) {
            Some(old) if old.key != key => old,
            _ => return,
        };
        if self.older.is_empty() {
            return;
        }
        let slot = self
            .older
            .iter()
            .position(|slot| slot.as_ref().is_none_or(|e| e.expiry <= now))
            .unwrap_or_else(|| {
                // All slots live: evict the one closest to expiry.
                self.older
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, slot)| slot.as_ref().map(|e| e.expiry))
                    .map(|(idx, _)| idx)
                    .unwrap_or(0)
            });
        self.older[slot] = Some(demoted);
    }

    pub fn clear(&mut self) {
        self.recent = None;
        for slot in &mut self.older {
            *slot = None;
        }
    }
}
