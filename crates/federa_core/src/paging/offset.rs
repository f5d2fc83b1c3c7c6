use federa_error::{ConnectorError, Result};
use tracing::debug;

use super::clause::inject_limit_offset;
use super::{Page, PageCursor, PaginationAdapter, Reauthenticate, with_reauth};
use crate::command::Command;
use crate::config::PagingConfig;
use crate::value::Row;

/// Backend that answers text queries with limit/offset clauses.
pub trait OffsetSource<C>: Reauthenticate<C> + Send {
    fn run_query(&mut self, conn: &mut C, query: &str) -> Result<Vec<Row>>;
}

/// Pages through an [`OffsetSource`] by rewriting the query for every page.
#[derive(Debug)]
pub struct OffsetPaginator<S> {
    source: S,
    query: String,
    /// Pushed down row limit.
    limit: Option<u64>,
    config: PagingConfig,
}

impl<S> OffsetPaginator<S> {
    pub fn new(source: S, query: impl Into<String>, limit: Option<u64>, config: PagingConfig) -> Self {
        OffsetPaginator {
            source,
            query: query.into(),
            limit,
            config,
        }
    }

    /// Page a command. A select's row limit is enforced by paging instead of
    /// being rendered into the query.
    pub fn for_command(source: S, command: &Command, config: PagingConfig) -> Self {
        match command {
            Command::Select(select) => {
                let mut unlimited = select.clone();
                let limit = unlimited.limit.take();
                Self::new(source, Command::Select(unlimited).to_string(), limit, config)
            }
            other => Self::new(source, other.to_string(), None, config),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<C, S: OffsetSource<C>> PaginationAdapter<C> for OffsetPaginator<S> {
    fn fetch_page(&mut self, conn: &mut C, cursor: Option<&PageCursor>, amount: usize) -> Result<Page> {
        let offset = match cursor {
            None => 0,
            Some(PageCursor::Offset(offset)) => *offset,
            Some(PageCursor::Token(token)) => {
                return Err(ConnectorError::InvalidArgument(format!(
                    "Offset paging cannot resume from token '{token}'"
                )));
            }
        };
        if amount == 0 {
            return Err(ConnectorError::InvalidArgument(
                "Page size must be greater than zero".to_string(),
            ));
        }

        let mut amount = amount as u64;
        if let Some(limit) = self.limit {
            if offset >= limit {
                return Ok(Page::last(Vec::new()));
            }
            amount = amount.min(limit - offset);
        }

        let query = inject_limit_offset(&self.query, amount, offset, &self.config.trailing_clauses);
        let out_of_range = self.config.out_of_range_status;

        let rows = with_reauth(&mut self.source, conn, |source, conn| {
            match source.run_query(conn, &query) {
                Err(ConnectorError::SourceStatus { status, message })
                    if Some(status) == out_of_range && offset > 0 =>
                {
                    debug!(status, %message, offset, "offset past end of data, ending paging");
                    Ok(Vec::new())
                }
                other => other,
            }
        })?;

        let fetched = rows.len() as u64;
        let end = offset + fetched;
        let limit_reached = self.limit.is_some_and(|limit| end >= limit);
        let next = if fetched >= amount && !limit_reached {
            Some(PageCursor::Offset(end))
        } else {
            None
        };
        Ok(Page { rows, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Select;
    use crate::value::Value;

    /// Serves `total` rows, parsing the trailing LIMIT/OFFSET of each query.
    struct Fixture {
        total: u64,
        queries: Vec<String>,
    }

    impl Reauthenticate<()> for Fixture {
        fn reauthenticate(&mut self, _conn: &mut ()) -> Result<()> {
            Ok(())
        }
    }

    impl OffsetSource<()> for Fixture {
        fn run_query(&mut self, _conn: &mut (), query: &str) -> Result<Vec<Row>> {
            self.queries.push(query.to_string());
            let words: Vec<&str> = query.split_whitespace().collect();
            let find = |kw: &str| {
                words
                    .iter()
                    .position(|w| *w == kw)
                    .and_then(|i| words.get(i + 1))
                    .and_then(|v| v.parse::<u64>().ok())
            };
            let limit = find("LIMIT").unwrap_or(u64::MAX);
            let offset = find("OFFSET").unwrap_or(0);
            if offset >= self.total && offset > 0 {
                return Err(ConnectorError::SourceStatus {
                    status: 500,
                    message: "offset out of range".to_string(),
                });
            }
            let end = offset.saturating_add(limit).min(self.total);
            Ok((offset..end).map(|i| vec![Value::Int(i as i64)]).collect())
        }
    }

    fn paginator(total: u64, limit: Option<u64>, out_of_range: Option<u16>) -> OffsetPaginator<Fixture> {
        OffsetPaginator::new(
            Fixture {
                total,
                queries: Vec::new(),
            },
            "SELECT A",
            limit,
            PagingConfig {
                out_of_range_status: out_of_range,
                ..Default::default()
            },
        )
    }

    #[test]
    fn full_pages_continue_short_page_ends() {
        let mut pager = paginator(5, None, None);
        let page = pager.fetch_page(&mut (), None, 2).unwrap();
        assert_eq!(Some(PageCursor::Offset(2)), page.next);
        let page = pager.fetch_page(&mut (), page.next.as_ref(), 2).unwrap();
        assert_eq!(Some(PageCursor::Offset(4)), page.next);
        let page = pager.fetch_page(&mut (), page.next.as_ref(), 2).unwrap();
        assert_eq!(vec![vec![Value::Int(4)]], page.rows);
        assert!(page.is_last());
        assert_eq!(
            vec!["SELECT A LIMIT 2", "SELECT A LIMIT 2 OFFSET 2", "SELECT A LIMIT 2 OFFSET 4"],
            pager.source().queries
        );
    }

    #[test]
    fn out_of_range_status_ends_paging() {
        // Exactly two full pages, the third request is past the end.
        let mut pager = paginator(4, None, Some(500));
        let page = pager
            .fetch_page(&mut (), Some(&PageCursor::Offset(4)), 2)
            .unwrap();
        assert!(page.rows.is_empty());
        assert!(page.is_last());

        let mut strict = paginator(4, None, None);
        let err = strict
            .fetch_page(&mut (), Some(&PageCursor::Offset(4)), 2)
            .unwrap_err();
        assert!(matches!(err, ConnectorError::SourceStatus { status: 500, .. }));
    }

    #[test]
    fn pushed_down_limit_clips_pages() {
        let mut pager = paginator(100, Some(5), None);
        let page = pager.fetch_page(&mut (), None, 3).unwrap();
        assert_eq!(3, page.rows.len());
        let page = pager.fetch_page(&mut (), page.next.as_ref(), 3).unwrap();
        assert_eq!(2, page.rows.len());
        assert!(page.is_last());
        assert_eq!("SELECT A LIMIT 2 OFFSET 3", pager.source().queries[1]);
    }

    #[test]
    fn select_limit_moves_into_paging() {
        let mut select = Select::all("sheet");
        select.limit = Some(7);
        let pager = OffsetPaginator::for_command(
            Fixture {
                total: 0,
                queries: Vec::new(),
            },
            &Command::Select(select),
            PagingConfig::default(),
        );
        assert_eq!("SELECT * FROM sheet", pager.query());
        assert_eq!(Some(7), pager.limit);
    }

    #[test]
    fn rejects_token_cursor() {
        let mut pager = paginator(1, None, None);
        let err = pager
            .fetch_page(&mut (), Some(&PageCursor::Token("t".to_string())), 1)
            .unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidArgument(_)));
    }
}
