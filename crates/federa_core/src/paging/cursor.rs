use federa_error::{ConnectorError, Result};

use super::{Page, PageCursor, PaginationAdapter, Reauthenticate, with_reauth};
use crate::value::Row;

/// Backend that returns a continuation token with every page.
pub trait CursorSource<C>: Reauthenticate<C> + Send {
    /// Fetch up to `amount` rows after `token`. A missing or blank returned
    /// token ends the result.
    fn fetch(&mut self, conn: &mut C, token: Option<&str>, amount: usize) -> Result<(Vec<Row>, Option<String>)>;
}

#[derive(Debug)]
pub struct CursorPaginator<S> {
    source: S,
}

impl<S> CursorPaginator<S> {
    pub fn new(source: S) -> Self {
        CursorPaginator { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<C, S: CursorSource<C>> PaginationAdapter<C> for CursorPaginator<S> {
    fn fetch_page(&mut self, conn: &mut C, cursor: Option<&PageCursor>, amount: usize) -> Result<Page> {
        let token = match cursor {
            None => None,
            Some(PageCursor::Token(token)) => Some(token.as_str()),
            Some(PageCursor::Offset(offset)) => {
                return Err(ConnectorError::InvalidArgument(format!(
                    "Cursor paging cannot resume from offset {offset}"
                )));
            }
        };

        let (rows, next) = with_reauth(&mut self.source, conn, |source, conn| {
            source.fetch(conn, token, amount)
        })?;
        let next = next
            .filter(|t| !t.trim().is_empty())
            .map(PageCursor::Token);
        Ok(Page { rows, next })
    }
}
