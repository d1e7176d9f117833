use std::time::Duration;

use tokio::time::{Instant, sleep_until};

use super::MIN_SEARCH_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keystroke {
    /// Input is too short to search; results should be emptied now.
    Cleared,
    Scheduled,
}

/// Debounces search input: a query fires only once the user stopped typing
/// for the whole debounce delay.
#[derive(Debug)]
pub struct SearchBox {
    debounce: Duration,
    pending: Option<(String, Instant)>,
}

impl SearchBox {
    pub fn new(debounce: Duration) -> Self {
        Self { debounce, pending: None }
    }

    pub fn input(&mut self, text: &str) -> Keystroke {
        let query = text.trim();
        if query.chars().count() < MIN_SEARCH_LEN {
            self.pending = None;
            return Keystroke::Cleared;
        }
        self.pending = Some((query.to_owned(), Instant::now() + self.debounce));
        Keystroke::Scheduled
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Resolves with the query once its delay ran out without further input.
    /// Never resolves while nothing is pending. Cancel safe.
    pub async fn settled(&mut self) -> String {
        let Some((_, deadline)) = &self.pending else {
            return std::future::pending().await;
        };
        sleep_until(*deadline).await;

        match self.pending.take() {
            Some((query, _)) => query,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{advance, timeout};

    use super::*;

    const DEBOUNCE: Duration = Duration::from_millis(300);

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_typing_stops() {
        let mut search = SearchBox::new(DEBOUNCE);

        assert_eq!(search.input("a"), Keystroke::Cleared);
        assert_eq!(search.input("al"), Keystroke::Scheduled);
        advance(Duration::from_millis(200)).await;
        assert_eq!(search.input("ali"), Keystroke::Scheduled);

        let typed_at = Instant::now();
        assert_eq!(search.settled().await, "ali");
        assert!(typed_at.elapsed() >= DEBOUNCE);
        assert!(!search.is_pending());

        assert!(timeout(Duration::from_secs(5), search.settled()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn short_input_cancels_pending_search() {
        let mut search = SearchBox::new(DEBOUNCE);
        search.input("bob");
        assert_eq!(search.input(" b "), Keystroke::Cleared);
        assert!(!search.is_pending());
        assert!(timeout(Duration::from_secs(1), search.settled()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_keeps_the_query() {
        let mut search = SearchBox::new(DEBOUNCE);
        search.input("carol");
        assert!(timeout(Duration::from_millis(100), search.settled()).await.is_err());
        assert!(search.is_pending());
        assert_eq!(search.settled().await, "carol");
    }
}
