use std::{
    collections::{HashMap, VecDeque},
    fmt,
    path::PathBuf,
    sync::Arc,
    time::SystemTime,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize, ser::SerializeMap};
use serde_json::{Map, Value};
use tokio::{
    fs::OpenOptions,
    io::AsyncWriteExt,
    sync::{RwLock, mpsc},
};
use tracing::{debug, warn};

use crate::protocol::InboundEvent;

const DEFAULT_RETENTION: usize = 256;

/// Browser tab identifier. Negative values mean the request has no owning tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub i64);

impl TabId {
    pub fn is_tracked(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Header name/value pairs in arrival order. A repeated name keeps its first
/// position and takes the latest value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList(Vec<(String, String)>);

impl HeaderList {
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderList {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut list = Self::default();
        for (name, value) in iter {
            list.insert(name, value);
        }
        list
    }
}

impl Serialize for HeaderList {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// License request body as the browser exposed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LicenseBody {
    Raw(Vec<u8>),
    Form(Map<String, Value>),
}

impl LicenseBody {
    pub fn summary(&self) -> String {
        match self {
            Self::Raw(bytes) => format!("{} raw bytes", bytes.len()),
            Self::Form(fields) => format!("{} form fields", fields.len()),
        }
    }
}

/// Everything observed for one tab. Each handler replaces whole field groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabRecord {
    pub manifest_url: Option<String>,
    pub license_url: Option<String>,
    pub body: Option<LicenseBody>,
    pub body_escaped: Option<String>,
    pub body_base64: Option<String>,
    pub headers: HeaderList,
    pub header_flags: String,
    pub title: Option<String>,
}

/// Source of the "currently active tab" answer.
#[async_trait]
pub trait TabQuery: Send + Sync {
    async fn active_tab(&self) -> Option<TabId>;
}

#[derive(Debug)]
pub struct TabStore {
    retention: usize,
    inner: RwLock<StoreInner>,
    event_logger: Option<Arc<EventLogger>>,
}

impl Default for TabStore {
    fn default() -> Self {
        Self::with_event_logger(DEFAULT_RETENTION, None)
    }
}

impl TabStore {
    #[cfg(test)]
    pub fn new(retention: usize) -> Self {
        Self::with_event_logger(retention, None)
    }

    pub fn with_event_logger(retention: usize, event_logger: Option<Arc<EventLogger>>) -> Self {
        Self {
            retention: retention.max(1),
            inner: RwLock::new(StoreInner::default()),
            event_logger,
        }
    }

    /// Applies `mutate` to the tab's record under one write guard and returns the
    /// updated record. Untracked tab ids are ignored and yield `None`.
    pub async fn update<F>(&self, tab: TabId, mutate: F) -> Option<TabRecord>
    where
        F: FnOnce(&mut TabRecord),
    {
        if !tab.is_tracked() {
            return None;
        }

        let mut inner = self.inner.write().await;
        inner.touch(tab);
        let record = inner.records.entry(tab).or_default();
        mutate(record);
        let updated = record.clone();

        while inner.order.len() > self.retention {
            if let Some(evicted) = inner.order.pop_front() {
                inner.records.remove(&evicted);
                debug!(tab = %evicted, "evicted tab record over retention");
            }
        }

        Some(updated)
    }

    /// Record for the tab, or an all-empty record when nothing was observed.
    pub async fn snapshot(&self, tab: TabId) -> TabRecord {
        self.get(tab).await.unwrap_or_default()
    }

    pub async fn get(&self, tab: TabId) -> Option<TabRecord> {
        let inner = self.inner.read().await;
        inner.records.get(&tab).cloned()
    }

    #[cfg(test)]
    pub async fn contains(&self, tab: TabId) -> bool {
        let inner = self.inner.read().await;
        inner.records.contains_key(&tab)
    }

    /// All tracked tabs, ordered by id.
    pub async fn tabs_snapshot(&self) -> Vec<(TabId, TabRecord)> {
        let inner = self.inner.read().await;
        let mut tabs: Vec<_> = inner
            .records
            .iter()
            .map(|(tab, record)| (*tab, record.clone()))
            .collect();
        tabs.sort_by_key(|(tab, _)| *tab);
        tabs
    }

    #[cfg(test)]
    pub async fn tab_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.records.len()
    }

    pub async fn evict(&self, tab: TabId) -> bool {
        let mut inner = self.inner.write().await;
        inner.order.retain(|existing| *existing != tab);
        if inner.active == Some(tab) {
            inner.active = None;
        }
        inner.records.remove(&tab).is_some()
    }

    pub async fn set_active(&self, tab: TabId) {
        let mut inner = self.inner.write().await;
        inner.active = tab.is_tracked().then_some(tab);
    }

    pub fn log_event(&self, event: InboundEvent) {
        if let Some(logger) = &self.event_logger {
            logger.log(event);
        }
    }
}

#[async_trait]
impl TabQuery for TabStore {
    async fn active_tab(&self) -> Option<TabId> {
        let inner = self.inner.read().await;
        inner.active
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    records: HashMap<TabId, TabRecord>,
    order: VecDeque<TabId>,
    active: Option<TabId>,
}

impl StoreInner {
    fn touch(&mut self, tab: TabId) {
        if self.order.back() == Some(&tab) {
            return;
        }
        self.order.retain(|existing| *existing != tab);
        self.order.push_back(tab);
    }
}

/// Appends every inbound event to a file for offline inspection.
#[derive(Debug)]
pub struct EventLogger {
    sender: mpsc::UnboundedSender<(SystemTime, InboundEvent)>,
}

impl EventLogger {
    pub fn new(path: PathBuf) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(SystemTime, InboundEvent)>();
        let logger = Arc::new(Self { sender: tx });

        tokio::spawn(async move {
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    while let Some((received_at, event)) = rx.recv().await {
                        let dump = format!("{received_at:?} {event:#?}\n");
                        if let Err(err) = file.write_all(dump.as_bytes()).await {
                            warn!(?err, "failed to write event dump");
                            break;
                        }
                    }
                }
                Err(err) => {
                    warn!(?err, path = %path.display(), "failed to open event dump file");
                    while rx.recv().await.is_some() {}
                }
            }
        });

        logger
    }

    pub fn log(&self, event: InboundEvent) {
        let _ = self.sender.send((SystemTime::now(), event));
    }
}
