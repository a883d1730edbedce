use std::sync::Arc;

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    command,
    correlator::Correlator,
    native::{NativeHost, NativeHostError},
    protocol::{
        DispatchResponse, EventAck, IconUpdate, Message, MessageSender, NativePayload, TabDataResponse,
    },
    state::{TabId, TabQuery, TabRecord},
};

const DEFAULT_TITLE: &str = "video";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No active tab found")]
    NoActiveTab,
    #[error("No data available for this tab")]
    NoRecordForTab(TabId),
    #[error("{0}")]
    Channel(#[from] NativeHostError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOptions {
    pub delete_me: bool,
}

/// Answers runtime messages from the popup, content observer and dashboard.
#[derive(Clone)]
pub struct Dispatcher {
    correlator: Correlator,
    tabs: Arc<dyn TabQuery>,
    native: Arc<dyn NativeHost>,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(
        correlator: Correlator,
        tabs: Arc<dyn TabQuery>,
        native: Arc<dyn NativeHost>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            correlator,
            tabs,
            native,
            options,
        }
    }

    /// Routes one message. `None` means the action produces no response.
    pub async fn handle(&self, message: Message, sender: &MessageSender) -> Option<Value> {
        match message {
            Message::GetTabData => Some(json!(self.get_tab_data().await)),
            Message::UpdateTitle { title } => {
                let tab = sender.tab.map(|tab| tab.id)?;
                let update = self.update_title(tab, title.as_deref().unwrap_or_default()).await;
                Some(json!(EventAck::from(update)))
            }
            Message::GetTitle => Some(json!({ "title": self.get_title().await })),
            Message::SendData { title } => {
                let response = self.send_data(title.as_deref()).await;
                Some(json!(response))
            }
            Message::Unknown => None,
        }
    }

    pub async fn get_tab_data(&self) -> TabDataResponse {
        let Some(tab) = self.tabs.active_tab().await else {
            return TabDataResponse::default();
        };

        let record = self.correlator.store().snapshot(tab).await;
        TabDataResponse {
            manifest_url: record.manifest_url.clone().unwrap_or_default(),
            curl_command: command::build_command(&record, self.correlator.policy().quote)
                .unwrap_or_default(),
            title: record.title.unwrap_or_default(),
        }
    }

    /// Stores a title pushed from the page of `tab`. The page sends decoded text, so only
    /// surrounding whitespace is dropped. Blank titles are ignored.
    pub async fn update_title(&self, tab: TabId, raw: &str) -> Option<IconUpdate> {
        let title = raw.trim().to_string();
        if title.is_empty() {
            return None;
        }

        info!(%tab, %title, "page title updated");
        self.correlator.on_title(tab, title).await
    }

    pub async fn get_title(&self) -> String {
        match self.tabs.active_tab().await {
            Some(tab) => self
                .correlator
                .store()
                .snapshot(tab)
                .await
                .title
                .unwrap_or_default(),
            None => String::new(),
        }
    }

    pub async fn send_data(&self, title_override: Option<&str>) -> DispatchResponse {
        let result = match self.tabs.active_tab().await {
            Some(tab) => self.send_for_tab(tab, title_override).await,
            None => Err(DispatchError::NoActiveTab),
        };

        match result {
            Ok((dispatch_id, response)) => DispatchResponse::Success {
                response,
                dispatch_id,
            },
            Err(err) => {
                error!(error = %err, "sendData failed");
                DispatchResponse::Error {
                    error: err.to_string(),
                }
            }
        }
    }

    /// Forwards the record for `tab` to the native host and returns its reply.
    pub async fn send_for_tab(
        &self,
        tab: TabId,
        title_override: Option<&str>,
    ) -> Result<(Uuid, Value), DispatchError> {
        let record = self
            .correlator
            .store()
            .get(tab)
            .await
            .ok_or(DispatchError::NoRecordForTab(tab))?;

        let dispatch_id = Uuid::new_v4();
        let payload = self.payload_for(&record, title_override);
        info!(%dispatch_id, %tab, title = %payload.title, "sending record to native host");

        match self.native.send(&payload).await {
            Ok(response) => {
                info!(%dispatch_id, "native host responded");
                Ok((dispatch_id, response))
            }
            Err(err) => {
                warn!(%dispatch_id, error = %err, "native host channel failed");
                Err(err.into())
            }
        }
    }

    fn payload_for(&self, record: &TabRecord, title_override: Option<&str>) -> NativePayload {
        let encoding = self.correlator.policy().body;
        let title = title_override
            .filter(|title| !title.is_empty())
            .or(record.title.as_deref().filter(|title| !title.is_empty()))
            .unwrap_or(DEFAULT_TITLE)
            .to_string();

        NativePayload {
            manifest_url: record.manifest_url.clone().unwrap_or_default(),
            license_url: record.license_url.clone().unwrap_or_default(),
            body_base64: encoding
                .wants_base64()
                .then(|| record.body_base64.clone().unwrap_or_default()),
            body_escaped: encoding
                .wants_escaped()
                .then(|| record.body_escaped.clone().unwrap_or_default()),
            headers: record.headers.clone(),
            title,
            delete_me: self.options.delete_me,
        }
    }
}
