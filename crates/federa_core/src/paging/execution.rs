use federa_error::Result;
use tracing::trace;

use super::{PageCursor, PaginationAdapter};
use crate::context::ExecutionContext;
use crate::execution::BackendExecution;
use crate::pool::PooledConnection;
use crate::value::Row;

/// Streams a paginated result as execution batches, one page per batch.
#[derive(Debug)]
pub struct PagedExecution<A> {
    adapter: A,
    cursor: Option<PageCursor>,
    pages: usize,
    done: bool,
}

impl<A> PagedExecution<A> {
    pub fn new(adapter: A) -> Self {
        PagedExecution {
            adapter,
            cursor: None,
            pages: 0,
            done: false,
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Pages fetched so far.
    pub fn pages(&self) -> usize {
        self.pages
    }
}

impl<C, A> BackendExecution<C> for PagedExecution<A>
where
    C: Send + 'static,
    A: PaginationAdapter<C>,
{
    fn execute(&mut self, _conn: &PooledConnection<C>, ctx: &ExecutionContext) -> Result<()> {
        ctx.cancel_flag().check("paged execution")?;
        self.cursor = None;
        self.pages = 0;
        self.done = false;
        Ok(())
    }

    fn next_batch(
        &mut self,
        conn: &PooledConnection<C>,
        ctx: &ExecutionContext,
        batch_size: usize,
    ) -> Result<Option<Vec<Row>>> {
        if self.done {
            return Ok(None);
        }
        ctx.cancel_flag().check("paged execution")?;

        let page = {
            let mut handle = conn.handle()?;
            self.adapter
                .fetch_page(&mut *handle, self.cursor.as_ref(), batch_size)?
        };
        self.pages += 1;
        trace!(execution_id = %ctx.execution_id(), page = self.pages, rows = page.rows.len(), "fetched page");

        self.done = page.next.is_none();
        self.cursor = page.next;
        if self.done && page.rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(page.rows))
    }
}
