use std::borrow::Cow;

use serde_json::Value;

use crate::{
    encode::{QuoteStyle, body_source, header_flags, quote_word},
    protocol::IconUpdate,
    state::{LicenseBody, TabId, TabRecord},
};

/// Reconstructs the license request as a single curl invocation.
///
/// Returns `None` unless the license URL, at least one header and a non-empty body are
/// all present. Header flags are rendered here in `quote` so one line never mixes
/// dialects. The body reaches curl through `--data-binary` from stdin or a decoded file,
/// so the replayed bytes match the captured ones exactly.
pub fn build_command(record: &TabRecord, quote: QuoteStyle) -> Option<String> {
    let url = record.license_url.as_deref().filter(|url| !url.is_empty())?;
    let body = body_bytes(record).filter(|body| !body.is_empty())?;
    if record.headers.is_empty() {
        return None;
    }

    let (prelude, source) = body_source(&body, quote);
    Some(format!(
        "{prelude}curl {}{} --data-binary {source}",
        quote_word(url, quote),
        header_flags(record.headers.iter(), quote),
    ))
}

/// Bytes the replay posts: raw uploads verbatim, form fields as their JSON text.
fn body_bytes(record: &TabRecord) -> Option<Cow<'_, [u8]>> {
    match record.body.as_ref()? {
        LicenseBody::Raw(bytes) => Some(Cow::Borrowed(bytes.as_slice())),
        LicenseBody::Form(fields) => Some(Cow::Owned(
            Value::Object(fields.clone()).to_string().into_bytes(),
        )),
    }
}

/// A tab is ready once a manifest was seen and the license request is replayable.
pub fn is_ready(record: &TabRecord, quote: QuoteStyle) -> bool {
    record.manifest_url.is_some() && build_command(record, quote).is_some()
}

pub fn icon_for(tab: TabId, record: &TabRecord, quote: QuoteStyle) -> IconUpdate {
    IconUpdate::new(tab, is_ready(record, quote))
}
