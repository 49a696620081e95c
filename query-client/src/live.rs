use crate::cache::digest;
use crate::client::QueryClient;
use crate::debounce::Debouncer;
use crate::descriptor::QueryDescriptor;
use crate::error::{Error, Result};
use crate::page::decode_items;
use crate::store::{ErrorFn, SharedDocumentStore, SnapshotFn, Unsubscribe};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Identity of a live channel: the canonical descriptor without page size.
pub fn channel_key(descriptor: &QueryDescriptor) -> String {
    digest(&[descriptor.live_view().as_str()])
}

/// An open live channel. Closing it (explicitly or by dropping) calls the
/// store's unsubscribe exactly once; callbacks that race with the close are
/// discarded.
#[derive(Debug)]
pub struct Subscription {
    key: String,
    collection_path: String,
    active: Arc<AtomicBool>,
    unsubscribe: Option<Unsubscribe>,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// False once the channel was closed or failed.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe.call();
            log::debug!("Closed live channel on {}", self.collection_path);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

pub(crate) fn open_channel<T, D, E>(
    store: &SharedDocumentStore,
    descriptor: &QueryDescriptor,
    on_data: D,
    on_error: E,
) -> Result<Subscription>
where
    T: DeserializeOwned + 'static,
    D: Fn(Vec<T>) + Send + Sync + 'static,
    E: Fn(Error) + Send + Sync + 'static,
{
    let path = descriptor.collection_path().to_string();
    let active = Arc::new(AtomicBool::new(true));
    let on_error = Arc::new(on_error);

    let on_snapshot: SnapshotFn = {
        let active = active.clone();
        let on_error = on_error.clone();
        let path = path.clone();
        Arc::new(move |documents| {
            if !active.load(Ordering::SeqCst) {
                return;
            }
            match decode_items::<T>(&path, documents) {
                Ok(items) => on_data(items),
                Err(err) => {
                    if active.swap(false, Ordering::SeqCst) {
                        log::warn!("Live snapshot on {} rejected: {}", path, err);
                        on_error(err);
                    }
                }
            }
        })
    };

    let on_channel_error: ErrorFn = {
        let active = active.clone();
        let path = path.clone();
        Arc::new(move |err| {
            if active.swap(false, Ordering::SeqCst) {
                log::warn!("Live channel on {} failed: {}", path, err);
                on_error(Error::Subscription(err));
            }
        })
    };

    let unsubscribe = store
        .subscribe_list(descriptor, on_snapshot, on_channel_error)
        .map_err(Error::Subscription)?;
    log::debug!("Opened live channel on {}", path);

    Ok(Subscription {
        key: channel_key(descriptor),
        collection_path: path,
        active,
        unsubscribe: Some(unsubscribe),
    })
}

/// What a live call site currently shows.
#[derive(Debug, Clone)]
pub struct LiveSnapshot<T> {
    /// Last result set received, kept after a channel error.
    pub data: Option<Vec<T>>,
    pub error: Option<Error>,
    generation: u64,
}

impl<T> LiveSnapshot<T> {
    pub fn is_loading(&self) -> bool {
        self.data.is_none() && self.error.is_none()
    }
}

struct Channel {
    base: QueryDescriptor,
    search_text: Option<String>,
    /// Bumped by every reconfigure; settled text from an older epoch is ignored.
    search_epoch: u64,
    key: String,
    subscription: Option<Subscription>,
}

impl Channel {
    fn effective(&self) -> QueryDescriptor {
        match &self.search_text {
            Some(text) => self.base.with_search_text(text.clone()),
            None => self.base.clone(),
        }
    }
}

struct Inner<T> {
    store: SharedDocumentStore,
    channel: Mutex<Channel>,
    state: Arc<watch::Sender<LiveSnapshot<T>>>,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, Channel> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Inner<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Make the open channel match `channel.effective()`. Returns whether a
    /// new channel was opened. The caller holds the channel lock, so the old
    /// channel is always closed before the new one opens.
    fn reopen(&self, channel: &mut Channel) -> Result<bool> {
        let descriptor = channel.effective();
        let key = channel_key(&descriptor);
        if channel.key == key && channel.subscription.is_some() {
            return Ok(false);
        }

        if let Some(previous) = channel.subscription.take() {
            previous.close();
        }
        channel.key = key;

        let mut generation = 0;
        self.state.send_modify(|snapshot| {
            snapshot.generation += 1;
            snapshot.data = None;
            snapshot.error = None;
            generation = snapshot.generation;
        });

        let on_data = {
            let state = self.state.clone();
            move |items: Vec<T>| {
                state.send_if_modified(|snapshot| {
                    if snapshot.generation != generation {
                        return false;
                    }
                    snapshot.data = Some(items);
                    true
                });
            }
        };
        let on_error = {
            let state = self.state.clone();
            move |err: Error| {
                state.send_if_modified(|snapshot| {
                    if snapshot.generation != generation {
                        return false;
                    }
                    snapshot.error = Some(err);
                    true
                });
            }
        };

        match open_channel(&self.store, &descriptor, on_data, on_error) {
            Ok(subscription) => {
                channel.subscription = Some(subscription);
                Ok(true)
            }
            Err(err) => {
                self.state.send_modify(|snapshot| snapshot.error = Some(err.clone()));
                Err(err)
            }
        }
    }
}

/// One live call site: at most one open channel at any time.
///
/// The channel follows the descriptor: [`reconfigure`](Self::reconfigure) and
/// settled [`set_search_text`](Self::set_search_text) input close the current
/// channel and open a new one, unless the canonical descriptor is unchanged.
/// Dropping the query closes its channel and cancels pending search input.
pub struct LiveQuery<T> {
    inner: Arc<Inner<T>>,
    debounce: Duration,
    search: Option<Debouncer<String>>,
    follower: Option<JoinHandle<()>>,
}

impl<T> LiveQuery<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub(crate) fn open(client: &QueryClient, descriptor: QueryDescriptor) -> Result<Self> {
        let (state, _) = watch::channel(LiveSnapshot {
            data: None,
            error: None,
            generation: 0,
        });
        let inner = Arc::new(Inner {
            store: client.store().clone(),
            channel: Mutex::new(Channel {
                base: descriptor,
                search_text: None,
                search_epoch: 0,
                key: String::new(),
                subscription: None,
            }),
            state: Arc::new(state),
        });

        {
            let mut channel = inner.lock();
            inner.reopen(&mut channel)?;
        }

        Ok(Self {
            inner,
            debounce: client.config().debounce(),
            search: None,
            follower: None,
        })
    }

    /// Point the call site at another descriptor. Returns whether the channel
    /// was replaced.
    ///
    /// The new descriptor's search text wins: settled and pending text from
    /// [`set_search_text`](Self::set_search_text) is discarded.
    pub fn reconfigure(&mut self, descriptor: QueryDescriptor) -> Result<bool> {
        self.stop_search();
        let mut channel = self.inner.lock();
        channel.base = descriptor;
        channel.search_text = None;
        channel.search_epoch += 1;
        self.inner.reopen(&mut channel)
    }

    /// Feed typed search text. The channel is replaced once the text settles.
    pub fn set_search_text(&mut self, text: impl Into<String>) -> Result<()> {
        if self.search.is_none() {
            let (initial, epoch) = {
                let channel = self.inner.lock();
                let Some(search) = channel.base.search() else {
                    return Err(Error::InvalidDescriptor(format!(
                        "live query on {} has no search field",
                        channel.base.collection_path()
                    )));
                };
                let initial = channel
                    .search_text
                    .clone()
                    .unwrap_or_else(|| search.text().clone());
                (initial, channel.search_epoch)
            };

            let debouncer = Debouncer::new(initial, self.debounce);
            self.follower = Some(spawn_follower(
                Arc::downgrade(&self.inner),
                debouncer.subscribe(),
                epoch,
            ));
            self.search = Some(debouncer);
        }

        if let Some(search) = self.search.as_mut() {
            search.set(text.into());
        }
        Ok(())
    }

    pub fn snapshot(&self) -> LiveSnapshot<T> {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every data, error or reconfiguration change.
    pub fn watch(&self) -> watch::Receiver<LiveSnapshot<T>> {
        self.inner.state.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().is_loading()
    }

    /// The descriptor the channel currently follows, search text included.
    pub fn descriptor(&self) -> QueryDescriptor {
        self.inner.lock().effective()
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .lock()
            .subscription
            .as_ref()
            .is_some_and(Subscription::is_active)
    }

    pub fn close(self) {}
}

fn spawn_follower<T>(
    inner: std::sync::Weak<Inner<T>>,
    mut settled: watch::Receiver<String>,
    epoch: u64,
) -> JoinHandle<()>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        while settled.changed().await.is_ok() {
            let text = settled.borrow_and_update().clone();
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let mut channel = inner.lock();
            if channel.search_epoch != epoch {
                break;
            }
            log::debug!("Search text settled on {:?}", text);
            channel.search_text = Some(text);
            if let Err(err) = inner.reopen(&mut channel) {
                log::warn!("Reopening live channel failed: {}", err);
            }
        }
    })
}

impl<T> LiveQuery<T> {
    /// Abort the settle follower and drop pending search input.
    fn stop_search(&mut self) {
        if let Some(follower) = self.follower.take() {
            follower.abort();
        }
        self.search = None;
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        self.stop_search();
        if let Some(subscription) = self.inner.lock().subscription.take() {
            subscription.close();
        }
    }
}
