use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::state::{HeaderList, TabId};

/// `webRequest.onCompleted` details.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedRequest {
    pub tab_id: TabId,
    pub method: String,
    pub url: String,
    #[serde(rename = "type", default)]
    pub resource_type: Option<String>,
}

/// `webRequest.onBeforeRequest` details, with the `requestBody` extra.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeforeRequest {
    pub tab_id: TabId,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub request_body: Option<RequestBody>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBody {
    #[serde(default)]
    pub raw: Vec<UploadData>,
    #[serde(default)]
    pub form_data: Option<Map<String, Value>>,
}

impl RequestBody {
    /// Concatenated bytes of every in-memory upload chunk, `None` when no chunk carries bytes.
    pub fn raw_bytes(&self) -> Option<Vec<u8>> {
        let mut chunks = self.raw.iter().filter_map(|chunk| chunk.bytes.as_deref()).peekable();
        chunks.peek()?;
        Some(chunks.flatten().copied().collect())
    }

    /// Paths of file-backed upload chunks, which carry no bytes to replay.
    pub fn skipped_files(&self) -> impl Iterator<Item = &str> {
        self.raw.iter().filter_map(|chunk| chunk.file.as_deref())
    }
}

/// One element of `requestBody.raw`. The shim ships `ArrayBuffer` bytes base64-encoded.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadData {
    #[serde(default, deserialize_with = "deserialize_base64")]
    pub bytes: Option<Vec<u8>>,
    #[serde(default)]
    pub file: Option<String>,
}

fn deserialize_base64<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded: Option<String> = Option::deserialize(deserializer)?;
    encoded
        .map(|text| STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom))
        .transpose()
}

/// `webRequest.onBeforeSendHeaders` details, with the `requestHeaders` extra.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeforeSendHeaders {
    pub tab_id: TabId,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub request_headers: Vec<HttpHeader>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl BeforeSendHeaders {
    pub fn header_list(&self) -> HeaderList {
        self.request_headers
            .iter()
            .map(|header| (header.name.clone(), header.value.clone()))
            .collect()
    }
}

/// `tabs.onActivated` / `tabs.onRemoved`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabLifecycle {
    pub tab_id: TabId,
}

/// Every inbound event, kept together for the debug dump.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Completed(CompletedRequest),
    BeforeRequest(BeforeRequest),
    BeforeSendHeaders(BeforeSendHeaders),
    TabActivated(TabLifecycle),
    TabRemoved(TabLifecycle),
}

/// Runtime message, discriminated by `action`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action")]
pub enum Message {
    #[serde(rename = "getTabData")]
    GetTabData,
    #[serde(rename = "updateTitle")]
    UpdateTitle {
        #[serde(default)]
        title: Option<String>,
    },
    #[serde(rename = "getTitle")]
    GetTitle,
    #[serde(rename = "sendData")]
    SendData {
        #[serde(default)]
        title: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageSender {
    #[serde(default)]
    pub tab: Option<SenderTab>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SenderTab {
    pub id: TabId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageEnvelope {
    #[serde(flatten)]
    pub message: Message,
    #[serde(default)]
    pub sender: MessageSender,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabDataResponse {
    pub manifest_url: String,
    pub curl_command: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DispatchResponse {
    Success {
        response: Value,
        #[serde(rename = "dispatchId")]
        dispatch_id: uuid::Uuid,
    },
    Error {
        error: String,
    },
}

/// Record handed to the native host. The receiver accepts either body field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NativePayload {
    pub manifest_url: String,
    pub license_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_escaped: Option<String>,
    pub headers: HeaderList,
    pub title: String,
    pub delete_me: bool,
}

/// Icon sizes the browser action declares.
pub const ICON_SIZES: [u32; 4] = [16, 32, 48, 128];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IconState {
    Ready,
    NotReady,
}

impl IconState {
    pub fn from_ready(ready: bool) -> Self {
        if ready { Self::Ready } else { Self::NotReady }
    }

    pub fn image(self) -> &'static str {
        match self {
            Self::Ready => "logo/hellyes.png",
            Self::NotReady => "logo/hellno.png",
        }
    }

    pub fn paths(self) -> BTreeMap<String, &'static str> {
        ICON_SIZES
            .iter()
            .map(|size| (size.to_string(), self.image()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IconUpdate {
    pub tab_id: TabId,
    pub state: IconState,
}

impl IconUpdate {
    pub fn new(tab_id: TabId, ready: bool) -> Self {
        Self {
            tab_id,
            state: IconState::from_ready(ready),
        }
    }
}

/// Acknowledgement returned for every inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventAck {
    pub tracked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<IconAck>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IconAck {
    pub tab_id: TabId,
    pub state: IconState,
    pub path: BTreeMap<String, &'static str>,
}

impl EventAck {
    pub fn ignored() -> Self {
        Self {
            tracked: false,
            icon: None,
        }
    }
}

impl From<Option<IconUpdate>> for EventAck {
    fn from(update: Option<IconUpdate>) -> Self {
        match update {
            Some(update) => Self {
                tracked: true,
                icon: Some(IconAck {
                    tab_id: update.tab_id,
                    state: update.state,
                    path: update.state.paths(),
                }),
            },
            None => Self::ignored(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_before_request_with_raw_chunks() {
        let raw = r#"
        {
            "tabId": 3,
            "method": "POST",
            "url": "https://x/license",
            "requestBody": {
                "raw": [ { "bytes": "AQI=" }, { "file": "/tmp/upload" }, { "bytes": "Aw==" } ]
            }
        }
        "#;

        let request: BeforeRequest = serde_json::from_str(raw).expect("should parse");
        let body = request.request_body.expect("body expected");
        assert_eq!(body.raw_bytes(), Some(vec![0x01, 0x02, 0x03]));
        assert_eq!(body.skipped_files().collect::<Vec<_>>(), vec!["/tmp/upload"]);
    }

    #[test]
    fn file_only_upload_has_no_raw_bytes() {
        let body: RequestBody =
            serde_json::from_value(json!({ "raw": [ { "file": "/tmp/a" } ] })).unwrap();
        assert_eq!(body.raw_bytes(), None);
    }

    #[test]
    fn rejects_invalid_base64_bytes() {
        let result = serde_json::from_value::<UploadData>(json!({ "bytes": "@@" }));
        assert!(result.is_err());
    }

    #[test]
    fn form_data_keeps_field_order() {
        let raw = r#"{ "formData": { "zeta": ["1"], "alpha": ["2"] } }"#;
        let body: RequestBody = serde_json::from_str(raw).unwrap();
        let keys: Vec<_> = body.form_data.unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
    }

    #[test]
    fn parses_completed_request_type() {
        let request: CompletedRequest = serde_json::from_value(json!({
            "tabId": -1,
            "method": "GET",
            "url": "https://x/manifest.mpd",
            "type": "xmlhttprequest"
        }))
        .unwrap();
        assert_eq!(request.tab_id, TabId(-1));
        assert_eq!(request.resource_type.as_deref(), Some("xmlhttprequest"));
    }

    #[test]
    fn parses_message_envelopes() {
        let envelope: MessageEnvelope = serde_json::from_value(json!({
            "action": "updateTitle",
            "title": "Show - S01E02",
            "sender": { "tab": { "id": 9 } }
        }))
        .unwrap();
        assert_eq!(
            envelope.message,
            Message::UpdateTitle {
                title: Some("Show - S01E02".into())
            }
        );
        assert_eq!(envelope.sender.tab.map(|tab| tab.id), Some(TabId(9)));

        let popup: MessageEnvelope =
            serde_json::from_value(json!({ "action": "sendData" })).unwrap();
        assert_eq!(popup.message, Message::SendData { title: None });
        assert!(popup.sender.tab.is_none());
    }

    #[test]
    fn unknown_actions_are_preserved_as_unknown() {
        let envelope: MessageEnvelope =
            serde_json::from_value(json!({ "action": "openOptions" })).unwrap();
        assert_eq!(envelope.message, Message::Unknown);
    }

    #[test]
    fn native_payload_uses_wire_field_names() {
        let mut headers = HeaderList::default();
        headers.insert("Content-Type", "application/octet-stream");
        let payload = NativePayload {
            manifest_url: "https://x/manifest.json".into(),
            license_url: "https://x/license".into(),
            body_base64: Some("AQI=".into()),
            body_escaped: None,
            headers,
            title: "video".into(),
            delete_me: false,
        };

        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({
                "manifestUrl": "https://x/manifest.json",
                "licenseUrl": "https://x/license",
                "bodyBase64": "AQI=",
                "headers": { "Content-Type": "application/octet-stream" },
                "title": "video",
                "deleteMe": false
            })
        );
    }

    #[test]
    fn error_response_matches_popup_contract() {
        let response = DispatchResponse::Error {
            error: "No active tab found".into(),
        };
        assert_eq!(
            serde_json::to_value(response).unwrap(),
            json!({ "status": "error", "error": "No active tab found" })
        );
    }

    #[test]
    fn ack_carries_icon_paths_for_every_size() {
        let ack = EventAck::from(Some(IconUpdate::new(TabId(4), true)));
        let value = serde_json::to_value(ack).unwrap();
        assert_eq!(value["tracked"], json!(true));
        assert_eq!(value["icon"]["tabId"], json!(4));
        assert_eq!(value["icon"]["state"], json!("ready"));
        for size in ICON_SIZES {
            assert_eq!(value["icon"]["path"][size.to_string()], json!("logo/hellyes.png"));
        }

        let ignored = serde_json::to_value(EventAck::from(None)).unwrap();
        assert_eq!(ignored, json!({ "tracked": false }));
    }
}
