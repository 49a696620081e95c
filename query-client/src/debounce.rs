use crate::descriptor::QueryDescriptor;
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Delays propagation of a rapidly changing value until it has been stable
/// for `delay`.
///
/// Only the most recent input is ever propagated: each [`set`](Self::set)
/// aborts the pending timer and starts a new one. Dropping the debouncer
/// aborts any pending timer, so no update lands after the owner is gone.
///
/// Timers run on the ambient tokio runtime; `set` must be called from within one.
pub struct Debouncer<T> {
    delay: Duration,
    settled: Arc<watch::Sender<T>>,
    pending: Option<JoinHandle<()>>,
}

impl<T> Debouncer<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(initial: T, delay: Duration) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            delay,
            settled: Arc::new(tx),
            pending: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Feed a new input value.
    pub fn set(&mut self, value: T) {
        self.cancel();

        let settled = self.settled.clone();
        let delay = self.delay;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            settled.send_if_modified(|current| {
                if *current == value {
                    return false;
                }
                *current = value;
                true
            });
        }));
    }

    /// The last settled value.
    pub fn get(&self) -> T {
        self.settled.borrow().clone()
    }

    /// Receiver notified each time a new value settles.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.settled.subscribe()
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Drop the pending update, if any. The settled value is left as is.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

/// A query descriptor whose search text is typed by a user.
///
/// Keystrokes go through a [`Debouncer`]; only the settled text ever becomes
/// part of the effective descriptor, so a burst of input yields one cache key
/// and one fetch instead of one per keystroke.
pub struct SearchInput {
    base: QueryDescriptor,
    text: Debouncer<String>,
}

impl SearchInput {
    pub fn new(base: QueryDescriptor, delay: Duration) -> Result<Self> {
        let initial = match base.search() {
            Some(search) => search.text().clone(),
            None => {
                return Err(Error::InvalidDescriptor(format!(
                    "query on {} has no search field",
                    base.collection_path()
                )))
            }
        };

        Ok(Self {
            base,
            text: Debouncer::new(initial, delay),
        })
    }

    pub fn input(&mut self, text: impl Into<String>) {
        self.text.set(text.into());
    }

    pub fn settled_text(&self) -> String {
        self.text.get()
    }

    pub fn is_settling(&self) -> bool {
        self.text.is_pending()
    }

    /// The descriptor to query with right now.
    pub fn effective(&self) -> QueryDescriptor {
        self.base.with_search_text(self.text.get())
    }

    /// Receiver notified whenever the search text settles on a new value.
    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.text.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn collect_changes<T: Clone + Send + Sync + 'static>(
        mut rx: watch::Receiver<T>,
    ) -> JoinHandle<Vec<T>> {
        tokio::spawn(async move {
            let mut seen = vec![];
            while rx.changed().await.is_ok() {
                seen.push(rx.borrow_and_update().clone());
            }
            seen
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_settles_once_on_last_value() {
        let mut debouncer = Debouncer::new(String::new(), Duration::from_millis(300));
        let changes = collect_changes(debouncer.subscribe());

        debouncer.set("ca".to_string());
        sleep(Duration::from_millis(50)).await;
        debouncer.set("cat".to_string());
        assert!(debouncer.is_pending());
        assert_eq!(debouncer.get(), "");

        sleep(Duration::from_millis(400)).await;
        assert_eq!(debouncer.get(), "cat");
        assert!(!debouncer.is_pending());

        drop(debouncer);
        assert_eq!(changes.await.unwrap(), vec!["cat".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_pauses_settle_separately() {
        let mut debouncer = Debouncer::new(0u32, Duration::from_millis(100));
        let changes = collect_changes(debouncer.subscribe());

        debouncer.set(1);
        sleep(Duration::from_millis(150)).await;
        debouncer.set(2);
        sleep(Duration::from_millis(150)).await;
        // same as settled value, no notification
        debouncer.set(2);
        sleep(Duration::from_millis(150)).await;

        drop(debouncer);
        assert_eq!(changes.await.unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_pending_update() {
        let mut debouncer = Debouncer::new("initial", Duration::from_millis(300));
        let rx = debouncer.subscribe();

        debouncer.set("late");
        drop(debouncer);
        sleep(Duration::from_millis(500)).await;

        assert_eq!(*rx.borrow(), "initial");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_keeps_settled_value() {
        let mut debouncer = Debouncer::new(1, Duration::from_millis(300));
        debouncer.set(2);
        debouncer.cancel();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(debouncer.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_input_effective_descriptor() {
        let base = QueryDescriptor::builder("shops")
            .search("name", "")
            .build()
            .unwrap();
        let mut search = SearchInput::new(base.clone(), DEFAULT_DEBOUNCE).unwrap();
        assert_eq!(search.effective().canonical(), base.canonical());

        search.input("ca");
        sleep(Duration::from_millis(50)).await;
        search.input("cat");
        assert!(search.is_settling());
        assert_eq!(search.effective().search_text(), None);

        sleep(DEFAULT_DEBOUNCE + Duration::from_millis(10)).await;
        assert_eq!(search.settled_text(), "cat");
        assert_eq!(search.effective().search_text(), Some("cat"));
    }

    #[test]
    fn test_search_input_requires_search_field() {
        let base = QueryDescriptor::builder("shops").build().unwrap();
        assert!(SearchInput::new(base, DEFAULT_DEBOUNCE).is_err());
    }
}
