//! Normalizes backend result paging.
//!
//! Offset/limit backends and continuation-cursor backends are both driven
//! through [`PaginationAdapter::fetch_page`]. A page without a next cursor is
//! the last one.

pub mod clause;
pub mod cursor;
pub mod execution;
pub mod offset;

use federa_error::{ConnectorError, Result};
use tracing::debug;

use crate::context::CancelFlag;
use crate::value::Row;

pub use cursor::{CursorPaginator, CursorSource};
pub use execution::PagedExecution;
pub use offset::{OffsetPaginator, OffsetSource};

/// Position of the next page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    Offset(u64),
    /// Opaque continuation token returned by the backend.
    Token(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub rows: Vec<Row>,
    pub next: Option<PageCursor>,
}

impl Page {
    /// Final page.
    pub fn last(rows: Vec<Row>) -> Self {
        Page { rows, next: None }
    }

    pub fn is_last(&self) -> bool {
        self.next.is_none()
    }
}

pub trait PaginationAdapter<C>: Send {
    /// Fetch up to `amount` rows starting at `cursor`. A None cursor starts
    /// from the beginning.
    fn fetch_page(&mut self, conn: &mut C, cursor: Option<&PageCursor>, amount: usize) -> Result<Page>;
}

/// Backend sessions that can refresh expired credentials.
pub trait Reauthenticate<C> {
    fn reauthenticate(&mut self, conn: &mut C) -> Result<()>;
}

/// Run `attempt`, re-authenticating and retrying once if credentials
/// expired. A failure on the retry is reported as a source operation
/// failure.
pub(crate) fn with_reauth<C, S, T>(
    source: &mut S,
    conn: &mut C,
    mut attempt: impl FnMut(&mut S, &mut C) -> Result<T>,
) -> Result<T>
where
    S: Reauthenticate<C> + ?Sized,
{
    match attempt(source, conn) {
        Err(ConnectorError::AuthExpired(msg)) => {
            debug!(reason = %msg, "credentials expired, re-authenticating");
            if let Err(e) = source.reauthenticate(conn) {
                return Err(ConnectorError::with_source("Re-authentication failed", Box::new(e)));
            }
            attempt(source, conn).map_err(|e| {
                if e.is_cancellation() {
                    e
                } else {
                    ConnectorError::with_source("Page fetch failed after re-authentication", Box::new(e))
                }
            })
        }
        other => other,
    }
}

/// Iterates the pages of an adapter until end of data.
///
/// Cancellation is checked before each page. The final empty page, if any,
/// is not yielded.
pub struct Pager<'a, C, A: PaginationAdapter<C> + ?Sized> {
    adapter: &'a mut A,
    conn: &'a mut C,
    cursor: Option<PageCursor>,
    amount: usize,
    cancel: CancelFlag,
    done: bool,
}

impl<'a, C, A: PaginationAdapter<C> + ?Sized> Pager<'a, C, A> {
    pub fn new(adapter: &'a mut A, conn: &'a mut C, amount: usize, cancel: CancelFlag) -> Self {
        Pager {
            adapter,
            conn,
            cursor: None,
            amount,
            cancel,
            done: false,
        }
    }

    /// Start from `cursor` instead of the beginning.
    pub fn starting_at(mut self, cursor: PageCursor) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

impl<C, A: PaginationAdapter<C> + ?Sized> Iterator for Pager<'_, C, A> {
    type Item = Result<Vec<Row>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Err(e) = self.cancel.check("paging") {
            self.done = true;
            return Some(Err(e));
        }
        match self
            .adapter
            .fetch_page(self.conn, self.cursor.as_ref(), self.amount)
        {
            Ok(page) => {
                self.cursor = page.next;
                self.done = self.cursor.is_none();
                if self.done && page.rows.is_empty() {
                    return None;
                }
                Some(Ok(page.rows))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    struct Counting {
        total: u64,
        expire_first: usize,
        reauths: usize,
    }

    impl Reauthenticate<()> for Counting {
        fn reauthenticate(&mut self, _conn: &mut ()) -> Result<()> {
            self.reauths += 1;
            Ok(())
        }
    }

    impl PaginationAdapter<()> for Counting {
        fn fetch_page(&mut self, conn: &mut (), cursor: Option<&PageCursor>, amount: usize) -> Result<Page> {
            let offset = match cursor {
                Some(PageCursor::Offset(o)) => *o,
                _ => 0,
            };
            let total = self.total;
            with_reauth(self, conn, |this, _| {
                if this.expire_first > 0 {
                    this.expire_first -= 1;
                    return Err(ConnectorError::AuthExpired("token".to_string()));
                }
                let end = (offset + amount as u64).min(total);
                let rows: Vec<Row> = (offset..end).map(|i| vec![Value::Int(i as i64)]).collect();
                let next = (end < total).then_some(PageCursor::Offset(end));
                Ok(Page { rows, next })
            })
        }
    }

    #[test]
    fn pager_yields_every_row_once() {
        let mut adapter = Counting {
            total: 7,
            expire_first: 0,
            reauths: 0,
        };
        let rows: Vec<_> = Pager::new(&mut adapter, &mut (), 3, CancelFlag::new())
            .collect::<Result<Vec<_>>>()
            .unwrap()
            .into_iter()
            .flatten()
            .collect();
        let expected: Vec<Row> = (0..7).map(|i| vec![Value::Int(i)]).collect();
        assert_eq!(expected, rows);
    }

    #[test]
    fn one_silent_reauth() {
        let mut adapter = Counting {
            total: 2,
            expire_first: 1,
            reauths: 0,
        };
        let page = adapter.fetch_page(&mut (), None, 10).unwrap();
        assert_eq!(2, page.rows.len());
        assert_eq!(1, adapter.reauths);
    }

    #[test]
    fn second_expiry_is_source_failure() {
        let mut adapter = Counting {
            total: 2,
            expire_first: 2,
            reauths: 0,
        };
        let err = adapter.fetch_page(&mut (), None, 10).unwrap_err();
        assert!(matches!(err, ConnectorError::SourceOperation { .. }), "{err}");
        assert_eq!(1, adapter.reauths);
    }

    #[test]
    fn pager_stops_when_cancelled() {
        let mut adapter = Counting {
            total: 100,
            expire_first: 0,
            reauths: 0,
        };
        let cancel = CancelFlag::new();
        let mut conn = ();
        let mut pager = Pager::new(&mut adapter, &mut conn, 10, cancel.clone());
        assert!(pager.next().unwrap().is_ok());
        cancel.cancel();
        assert!(pager.next().unwrap().unwrap_err().is_cancellation());
        assert!(pager.next().is_none());
    }
}
