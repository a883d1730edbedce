use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use crate::{
    command,
    encode::{EncodingPolicy, bytes_to_base64, bytes_to_escaped, header_flags},
    protocol::{
        BeforeRequest, BeforeSendHeaders, CompletedRequest, IconUpdate, InboundEvent,
        TabLifecycle,
    },
    state::{LicenseBody, TabId, TabRecord, TabStore},
};

static MANIFEST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)manifest|license").unwrap());
static LICENSE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)license").unwrap());

/// Merges the three facets of a license exchange into the per-tab store.
///
/// Each handler touches a disjoint group of [`TabRecord`] fields, so the final
/// record does not depend on the order the browser delivers the callbacks in.
#[derive(Debug, Clone)]
pub struct Correlator {
    store: Arc<TabStore>,
    policy: EncodingPolicy,
}

impl Correlator {
    pub fn new(store: Arc<TabStore>, policy: EncodingPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<TabStore> {
        &self.store
    }

    pub fn policy(&self) -> EncodingPolicy {
        self.policy
    }

    pub async fn on_completed(&self, request: CompletedRequest) -> Option<IconUpdate> {
        self.store.log_event(InboundEvent::Completed(request.clone()));

        if !request.method.eq_ignore_ascii_case("GET")
            || request.resource_type.as_deref() == Some("image")
            || !MANIFEST_RE.is_match(&request.url)
        {
            return None;
        }

        let url = request.url;
        debug!(tab = %request.tab_id, %url, "matched manifest candidate");
        self.apply(request.tab_id, move |record| record.manifest_url = Some(url))
            .await
    }

    pub async fn on_before_request(&self, request: BeforeRequest) -> Option<IconUpdate> {
        self.store
            .log_event(InboundEvent::BeforeRequest(request.clone()));

        if !is_license_post(&request.method, &request.url) {
            return None;
        }

        if let Some(body) = &request.request_body {
            for file in body.skipped_files() {
                debug!(tab = %request.tab_id, file, "skipping file-backed upload chunk");
            }
        }

        let body = request.request_body.as_ref().and_then(|body| {
            match body.raw_bytes() {
                Some(bytes) => Some(LicenseBody::Raw(bytes)),
                None => body.form_data.clone().map(LicenseBody::Form),
            }
        });

        let (escaped, base64) = match &body {
            Some(LicenseBody::Raw(bytes)) => (
                Some(bytes_to_escaped(bytes)),
                self.policy.body.wants_base64().then(|| bytes_to_base64(bytes)),
            ),
            Some(LicenseBody::Form(fields)) => {
                let display = serde_json::Value::Object(fields.clone()).to_string();
                let base64 = self.policy.body.wants_base64().then(|| display.clone());
                (Some(display), base64)
            }
            None => (None, None),
        };

        debug!(
            tab = %request.tab_id,
            url = %request.url,
            body = %body.as_ref().map(LicenseBody::summary).unwrap_or_else(|| "none".into()),
            "matched license request body"
        );

        let url = request.url;
        self.apply(request.tab_id, move |record| {
            record.license_url = Some(url);
            record.body = body;
            record.body_escaped = escaped;
            record.body_base64 = base64;
        })
        .await
    }

    pub async fn on_before_send_headers(&self, request: BeforeSendHeaders) -> Option<IconUpdate> {
        self.store
            .log_event(InboundEvent::BeforeSendHeaders(request.clone()));

        if !is_license_post(&request.method, &request.url) {
            return None;
        }

        let headers = request.header_list();
        let flags = header_flags(headers.iter(), self.policy.quote);
        debug!(
            tab = %request.tab_id,
            url = %request.url,
            headers = headers.len(),
            "matched license request headers"
        );

        self.apply(request.tab_id, move |record| {
            record.headers = headers;
            record.header_flags = flags;
        })
        .await
    }

    pub async fn on_tab_activated(&self, event: TabLifecycle) {
        self.store.log_event(InboundEvent::TabActivated(event));
        self.store.set_active(event.tab_id).await;
    }

    pub async fn on_tab_removed(&self, event: TabLifecycle) -> bool {
        self.store.log_event(InboundEvent::TabRemoved(event));
        let evicted = self.store.evict(event.tab_id).await;
        if evicted {
            info!(tab = %event.tab_id, "tab closed; dropped its record");
        }
        evicted
    }

    /// Merges a page title pushed by the content observer.
    pub async fn on_title(&self, tab: TabId, title: String) -> Option<IconUpdate> {
        self.apply(tab, move |record| record.title = Some(title)).await
    }

    async fn apply<F>(&self, tab: TabId, mutate: F) -> Option<IconUpdate>
    where
        F: FnOnce(&mut TabRecord),
    {
        let record = self.store.update(tab, mutate).await?;
        let icon = command::icon_for(tab, &record, self.policy.quote);
        debug!(%tab, state = ?icon.state, "icon recomputed");
        Some(icon)
    }
}

fn is_license_post(method: &str, url: &str) -> bool {
    method.eq_ignore_ascii_case("POST") && LICENSE_RE.is_match(url)
}
