//! Keyset pagination shared by every list operation.
//!
//! A cursor encodes the `(created_at, id)` key of the last row handed out.
//! The next page is everything strictly after that key in the listing's
//! order, so a cursor stays usable after its row is deleted: it never
//! resolves to an error, only to fewer rows.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};

pub const DEFAULT_LIMIT: u32 = 50;
pub const MAX_LIMIT: u32 = 1000;

const CURSOR_VERSION: &str = "c1";

/// Position in a `(created_at, id)`-ordered listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl Cursor {
    pub fn new(created_at: DateTime<Utc>, id: Uuid) -> Self {
        Self { created_at, id }
    }

    /// Opaque token handed to callers.
    pub fn encode(&self) -> String {
        format!(
            "{CURSOR_VERSION}.{}.{}",
            self.created_at.timestamp_micros(),
            self.id.simple()
        )
    }

    pub fn decode(token: &str) -> Result<Self> {
        let invalid = || Error::InvalidCursor(token.to_string());

        let mut parts = token.splitn(3, '.');
        if parts.next() != Some(CURSOR_VERSION) {
            return Err(invalid());
        }
        let micros: i64 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let id = parts
            .next()
            .and_then(|p| Uuid::parse_str(p).ok())
            .ok_or_else(invalid)?;
        let created_at = DateTime::from_timestamp_micros(micros).ok_or_else(invalid)?;

        Ok(Self { created_at, id })
    }
}

/// Limit and optional cursor for one page.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub limit: u32,
    pub cursor: Option<String>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            cursor: None,
        }
    }
}

impl PageRequest {
    /// A zero limit means the default.
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            cursor: None,
        }
    }

    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        let cursor = cursor.into();
        self.cursor = (!cursor.is_empty()).then_some(cursor);
        self
    }

    /// Effective page size.
    pub fn limit(&self) -> u32 {
        match self.limit {
            0 => DEFAULT_LIMIT,
            n => n.min(MAX_LIMIT),
        }
    }

    /// Rows to ask the store for: one more than the page, to detect a next page.
    pub(crate) fn fetch_limit(&self) -> i64 {
        i64::from(self.limit()) + 1
    }

    pub(crate) fn decode_cursor(&self) -> Result<Option<Cursor>> {
        self.cursor.as_deref().map(Cursor::decode).transpose()
    }
}

/// One page of results. `next_cursor` is `None` at the end of the list.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }

    /// Trim a `limit + 1` fetch down to `limit` rows and derive the cursor
    /// from the last row kept.
    pub(crate) fn from_rows(mut rows: Vec<T>, request: &PageRequest, key: impl Fn(&T) -> Cursor) -> Self {
        let limit = request.limit() as usize;
        if rows.len() > limit {
            rows.truncate(limit);
            let next_cursor = rows.last().map(|row| key(row).encode());
            Self {
                items: rows,
                next_cursor,
            }
        } else {
            Self {
                items: rows,
                next_cursor: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(micros: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(micros).unwrap()
    }

    #[test]
    fn cursor_round_trips() {
        let cursor = Cursor::new(at(1_700_000_000_123_456), Uuid::new_v4());
        assert_eq!(Cursor::decode(&cursor.encode()).unwrap(), cursor);
    }

    #[test]
    fn garbage_cursor_is_rejected() {
        for token in ["", "abc", "c1.notanumber.x", "c2.1.00000000000000000000000000000000", "c1.5"] {
            let err = Cursor::decode(token).unwrap_err();
            assert!(matches!(err, Error::InvalidCursor(_)), "{token}: {err:?}");
        }
    }

    #[test]
    fn zero_limit_uses_default_and_large_limits_clamp() {
        assert_eq!(PageRequest::new(0).limit(), DEFAULT_LIMIT);
        assert_eq!(PageRequest::new(2).limit(), 2);
        assert_eq!(PageRequest::new(1_000_000).limit(), MAX_LIMIT);
        assert_eq!(PageRequest::new(2).fetch_limit(), 3);
    }

    #[test]
    fn empty_cursor_string_means_first_page() {
        let req = PageRequest::new(10).after("");
        assert!(req.cursor.is_none());
        assert!(req.decode_cursor().unwrap().is_none());
    }

    #[test]
    fn overfetched_rows_yield_cursor_of_last_kept_row() {
        let rows: Vec<Cursor> = (0..3).map(|i| Cursor::new(at(i), Uuid::new_v4())).collect();
        let req = PageRequest::new(2);

        let page = Page::from_rows(rows.clone(), &req, |c| *c);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_cursor, Some(rows[1].encode()));

        let last = Page::from_rows(rows[2..].to_vec(), &req, |c| *c);
        assert_eq!(last.items.len(), 1);
        assert!(!last.has_more());
    }
}
