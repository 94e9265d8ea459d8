//! Cursor handling for NerdGraph pagination.
//!
//! A page of results carries an optional `nextCursor`. The traversal threads
//! it untouched from the response of page *n* into the request of page
//! *n + 1* and stops once a page comes back without one.

/// Literal interpolated into a query when no cursor is available.
pub const NO_CURSOR: &str = "null";

/// Renders a cursor as the GraphQL argument literal the remote API expects.
///
/// The cursor text itself is reproduced verbatim.
pub fn encode_cursor(cursor: Option<&str>) -> String {
    match cursor {
        Some(cursor) => format!("\"{cursor}\""),
        None => NO_CURSOR.to_string()
    }
}

/// One page of results as returned by a single query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next_cursor: Option<String>) -> Self {
        Self { items, next_cursor }
    }
}

/// Loop state of one pagination level.
///
/// The state is consumed and returned by [`TraversalState::advance`] on each
/// page so that the cursor is never mutated outside the transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalState<T> {
    cursor: Option<String>,
    items: Vec<T>,
    pages: usize,
    exhausted: bool
}

impl<T> Default for TraversalState<T> {
    fn default() -> Self {
        Self::start()
    }
}

impl<T> TraversalState<T> {
    /// State before the first page: no cursor, nothing accumulated.
    pub fn start() -> Self {
        Self {
            cursor: None,
            items: Vec::new(),
            pages: 0,
            exhausted: false
        }
    }

    /// Cursor to send with the next request.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Literal for the next request, see [`encode_cursor`].
    pub fn encoded_cursor(&self) -> String {
        encode_cursor(self.cursor())
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Folds a fetched page into the state.
    ///
    /// Items are appended in page order. An empty page is still a page: its
    /// cursor decides whether the level continues.
    #[must_use]
    pub fn advance(mut self, page: Page<T>) -> Self {
        self.items.extend(page.items);
        self.pages += 1;
        self.exhausted = page.next_cursor.is_none();
        self.cursor = page.next_cursor;
        self
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_cursor_encodes_as_null() {
        assert_eq!(encode_cursor(None), "null");
    }

    #[test]
    fn test_empty_cursor_is_not_null() {
        assert_eq!(encode_cursor(Some("")), "\"\"");
    }

    #[test]
    fn test_present_cursor_is_kept_verbatim() {
        assert_eq!(encode_cursor(Some(" MjA= ")), "\" MjA= \"");
        assert_eq!(encode_cursor(Some("a/b+c==")), "\"a/b+c==\"");
    }

    #[test]
    fn test_advance_threads_cursor_and_accumulates() {
        let state = TraversalState::start();
        assert_eq!(state.cursor(), None);
        assert_eq!(state.encoded_cursor(), "null");
        assert!(!state.is_exhausted());

        let state = state.advance(Page::new(vec![1, 2], Some("c1".to_string())));
        assert_eq!(state.cursor(), Some("c1"));
        assert_eq!(state.encoded_cursor(), "\"c1\"");
        assert!(!state.is_exhausted());

        let state = state.advance(Page::new(vec![3], None));
        assert!(state.is_exhausted());
        assert_eq!(state.pages(), 2);
        assert_eq!(state.into_items(), vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_page_still_moves_cursor() {
        let state: TraversalState<u8> =
            TraversalState::start().advance(Page::new(vec![], Some("c2".to_string())));
        assert_eq!(state.cursor(), Some("c2"));
        assert!(!state.is_exhausted());
        assert!(state.items().is_empty());

        let state = state.advance(Page::new(vec![], None));
        assert!(state.is_exhausted());
        assert_eq!(state.pages(), 2);
    }
}
