use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};

use crate::error::{BackendError, Result};
use crate::part::Part;

/// Lazy, forward-only sequence of listed parts.
pub type PartStream<'a> = BoxStream<'a, Result<Part>>;

/// Listing cursor: an opaque continuation token plus a `done` flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Marker {
    token: Option<String>,
    done: bool,
}

impl Marker {
    /// Cursor positioned before the first page.
    pub fn start() -> Self {
        Self::default()
    }

    /// Cursor following a page; no token means the listing is exhausted.
    pub fn after(token: Option<String>) -> Self {
        Self {
            done: token.is_none(),
            token,
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// One page returned by a store's listing API.
#[derive(Debug, Default)]
pub struct Page {
    pub parts: Vec<Part>,
    pub next: Marker,
}

/// A store listing API that hands out one page per call.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, marker: &Marker) -> Result<Page>;
}

#[async_trait]
impl<T: PageSource + ?Sized> PageSource for &T {
    async fn fetch_page(&self, marker: &Marker) -> Result<Page> {
        (**self).fetch_page(marker).await
    }
}

struct Pager<S> {
    source: S,
    marker: Marker,
    pending: VecDeque<Part>,
    seen: HashSet<String>,
}

impl<S: PageSource> Pager<S> {
    async fn next(mut self) -> Result<Option<(Part, Self)>> {
        loop {
            if let Some(part) = self.pending.pop_front() {
                return Ok(Some((part, self)));
            }
            if self.marker.is_done() {
                return Ok(None);
            }
            let page = self.source.fetch_page(&self.marker).await?;
            // A token handed out twice means the store is cycling.
            if let Some(token) = page.next.token()
                && !self.seen.insert(token.to_string())
            {
                return Err(BackendError::transfer(
                    token,
                    "listing marker repeated",
                    false,
                ));
            }
            self.pending.extend(page.parts);
            self.marker = page.next;
        }
    }
}

/// Flattens a paged listing into a single stream of parts.
///
/// Pages are fetched on demand. The first fetch error ends the stream; parts
/// yielded before it remain valid.
pub fn paginate<'a, S>(source: S) -> PartStream<'a>
where
    S: PageSource + 'a,
{
    let pager = Pager {
        source,
        marker: Marker::start(),
        pending: VecDeque::new(),
        seen: HashSet::new(),
    };
    stream::try_unfold(pager, Pager::next).boxed()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::TryStreamExt;

    use super::*;

    /// Serves fixed pages keyed by index-as-token.
    struct Fixed {
        pages: Vec<Vec<&'static str>>,
        fail_at: Option<usize>,
        fetches: AtomicUsize,
    }

    impl Fixed {
        fn new(pages: Vec<Vec<&'static str>>) -> Self {
            Self {
                pages,
                fail_at: None,
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PageSource for Fixed {
        async fn fetch_page(&self, marker: &Marker) -> Result<Page> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let idx: usize = marker.token().map_or(0, |t| t.parse().unwrap());
            if self.fail_at == Some(idx) {
                return Err(BackendError::transfer("listing", "boom", true));
            }
            let parts = self.pages[idx]
                .iter()
                .map(|p| Part::new(*p, 1, "f"))
                .collect();
            let next = (idx + 1 < self.pages.len()).then(|| (idx + 1).to_string());
            Ok(Page {
                parts,
                next: Marker::after(next),
            })
        }
    }

    fn paths(parts: &[Part]) -> Vec<&str> {
        parts.iter().map(|p| p.path.as_str()).collect()
    }

    #[test]
    fn marker_states() {
        assert!(!Marker::start().is_done());
        assert!(Marker::after(None).is_done());
        let m = Marker::after(Some("t".into()));
        assert!(!m.is_done());
        assert_eq!(m.token(), Some("t"));
    }

    #[tokio::test]
    async fn flattens_pages_in_order() {
        let source = Fixed::new(vec![vec!["a", "b"], vec![], vec!["c"]]);
        let parts: Vec<Part> = paginate(source).try_collect().await.unwrap();
        assert_eq!(paths(&parts), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn empty_listing() {
        let source = Fixed::new(vec![vec![]]);
        let parts: Vec<Part> = paginate(source).try_collect().await.unwrap();
        assert!(parts.is_empty());
    }

    #[tokio::test]
    async fn fetches_lazily() {
        let source = Fixed::new(vec![vec!["a"], vec!["b"], vec!["c"]]);
        let mut stream = paginate(&source);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(stream.next().await.unwrap().unwrap().path, "a");
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_ends_stream_after_yielded_items() {
        let mut source = Fixed::new(vec![vec!["a"], vec!["b"], vec!["c"]]);
        source.fail_at = Some(1);
        let items: Vec<Result<Part>> = paginate(source).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().path, "a");
        assert!(items[1].as_ref().unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn stuck_marker_is_an_error() {
        struct Stuck;

        #[async_trait]
        impl PageSource for Stuck {
            async fn fetch_page(&self, _marker: &Marker) -> Result<Page> {
                Ok(Page {
                    parts: vec![Part::new("x", 1, "f")],
                    next: Marker::after(Some("same".into())),
                })
            }
        }

        let items: Vec<Result<Part>> = paginate(Stuck).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().path, "x");
        assert!(!items[1].as_ref().unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn marker_cycle_is_an_error() {
        /// Hands out tokens a -> b -> a -> ...
        struct Cycle;

        #[async_trait]
        impl PageSource for Cycle {
            async fn fetch_page(&self, marker: &Marker) -> Result<Page> {
                let (path, next) = match marker.token() {
                    None => ("start", "a"),
                    Some("a") => ("from-a", "b"),
                    Some(_) => ("from-b", "a"),
                };
                Ok(Page {
                    parts: vec![Part::new(path, 1, "f")],
                    next: Marker::after(Some(next.into())),
                })
            }
        }

        let items: Vec<Result<Part>> = paginate(Cycle).collect().await;
        let paths: Vec<&str> = items
            .iter()
            .filter_map(|item| item.as_ref().ok())
            .map(|p| p.path.as_str())
            .collect();
        assert_eq!(paths, ["start", "from-a"]);
        assert!(items.last().unwrap().is_err());
    }
}
