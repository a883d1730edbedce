use serde_json::Value;

use crate::{
    command,
    encode::QuoteStyle,
    state::{LicenseBody, TabId, TabRecord},
};

const BODY_PREVIEW_CHARS: usize = 96;

#[derive(Debug, Clone)]
pub struct DetailViewModel {
    pub header: String,
    pub footer: String,
    pub lines: Vec<DetailLine>,
}

#[derive(Debug, Clone)]
pub struct DetailLine {
    pub indent: usize,
    pub segments: Vec<DetailSegment>,
}

#[derive(Debug, Clone)]
pub struct DetailSegment {
    pub text: String,
    pub style: SegmentStyle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStyle {
    Plain,
    Key,
    String,
    Number,
    Ready,
    Missing,
    Command,
}

pub fn build_detail_view(tab: TabId, record: &TabRecord, quote: QuoteStyle) -> DetailViewModel {
    let ready = command::is_ready(record, quote);
    let header = format!(
        "Tab {} • {}",
        tab,
        if ready { "ready to send" } else { "waiting for traffic" }
    );

    let mut lines = vec![
        field_line("Title", record.title.as_deref()),
        field_line("Manifest", record.manifest_url.as_deref()),
        field_line("License", record.license_url.as_deref()),
        empty_line(0),
    ];

    lines.push(section_line(
        "Headers",
        (!record.headers.is_empty()).then(|| record.headers.len().to_string()),
    ));
    for (name, value) in record.headers.iter() {
        lines.push(DetailLine {
            indent: 1,
            segments: vec![
                segment(format!("{name}: "), SegmentStyle::Key),
                segment(value.to_string(), SegmentStyle::String),
            ],
        });
    }

    lines.push(section_line("Body", record.body.as_ref().map(body_size)));
    match &record.body {
        Some(LicenseBody::Form(fields)) => {
            for (name, value) in fields {
                lines.push(DetailLine {
                    indent: 1,
                    segments: vec![
                        segment(format!("{name}: "), SegmentStyle::Key),
                        segment(json_value_preview(value), SegmentStyle::String),
                    ],
                });
            }
        }
        Some(LicenseBody::Raw(_)) => {
            if let Some(escaped) = &record.body_escaped {
                lines.push(DetailLine {
                    indent: 1,
                    segments: vec![segment(
                        truncate(escaped, BODY_PREVIEW_CHARS),
                        SegmentStyle::Number,
                    )],
                });
            }
        }
        None => {}
    }

    lines.push(empty_line(0));
    match command::build_command(record, quote) {
        Some(curl) => {
            lines.push(section_line("Replay", Some("curl".into())));
            lines.push(DetailLine {
                indent: 1,
                segments: vec![segment(curl, SegmentStyle::Command)],
            });
        }
        None => lines.push(DetailLine {
            indent: 0,
            segments: vec![
                segment("Replay: ".into(), SegmentStyle::Key),
                segment(
                    "incomplete (needs license URL, headers and body)".into(),
                    SegmentStyle::Missing,
                ),
            ],
        }),
    }

    let footer = if ready {
        "press `s` to send this record to the native host".to_string()
    } else {
        String::new()
    };

    DetailViewModel {
        header,
        footer,
        lines,
    }
}

/// One-line summary used by the tab list.
pub fn tab_label(record: &TabRecord) -> String {
    record
        .title
        .clone()
        .or_else(|| record.manifest_url.clone())
        .or_else(|| record.license_url.clone())
        .unwrap_or_else(|| "(no title yet)".to_string())
}

fn field_line(label: &str, value: Option<&str>) -> DetailLine {
    let value_segment = match value {
        Some(value) => segment(value.to_string(), SegmentStyle::Ready),
        None => segment("missing".into(), SegmentStyle::Missing),
    };

    DetailLine {
        indent: 0,
        segments: vec![segment(format!("{label}: "), SegmentStyle::Key), value_segment],
    }
}

fn section_line(label: &str, summary: Option<String>) -> DetailLine {
    let summary = match summary {
        Some(text) => segment(text, SegmentStyle::Plain),
        None => segment("none".into(), SegmentStyle::Missing),
    };

    DetailLine {
        indent: 0,
        segments: vec![segment(format!("{label}: "), SegmentStyle::Key), summary],
    }
}

fn segment(text: String, style: SegmentStyle) -> DetailSegment {
    DetailSegment { text, style }
}

fn empty_line(indent: usize) -> DetailLine {
    DetailLine {
        indent,
        segments: vec![segment(String::new(), SegmentStyle::Plain)],
    }
}

fn body_size(body: &LicenseBody) -> String {
    match body {
        LicenseBody::Raw(bytes) => format_bytes(bytes.len()),
        LicenseBody::Form(_) => body.summary(),
    }
}

fn format_bytes(len: usize) -> String {
    let mut size = len as f64;
    let units = ["B", "KB", "MB", "GB"];
    let mut unit_index = 0;
    while size >= 1024.0 && unit_index + 1 < units.len() {
        size /= 1024.0;
        unit_index += 1;
    }
    if unit_index == 0 {
        format!("{len} B")
    } else {
        format!("{:.2} {}", size, units[unit_index])
    }
}

fn json_value_preview(value: &Value) -> String {
    match value {
        Value::String(text) => text.to_string(),
        Value::Array(items) => items
            .iter()
            .map(json_value_preview)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    truncated.push('…');
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        encode::{bytes_to_escaped, header_flags},
        state::HeaderList,
    };
    use serde_json::json;

    fn flatten(detail: &DetailViewModel) -> Vec<String> {
        detail
            .lines
            .iter()
            .map(|line| {
                line.segments
                    .iter()
                    .map(|segment| segment.text.as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .collect()
    }

    #[test]
    fn empty_record_marks_everything_missing() {
        let detail = build_detail_view(TabId(1), &TabRecord::default(), QuoteStyle::Single);
        let rendered = flatten(&detail);

        assert_eq!(detail.header, "Tab 1 • waiting for traffic");
        assert!(rendered.contains(&"Manifest: missing".to_string()));
        assert!(rendered.iter().any(|line| line.starts_with("Replay: incomplete")));
        assert!(detail.footer.is_empty());
    }

    #[test]
    fn ready_record_shows_headers_body_and_command() {
        let headers: HeaderList = [("Content-Type", "application/octet-stream")]
            .into_iter()
            .collect();
        let record = TabRecord {
            manifest_url: Some("https://x/manifest.json".into()),
            license_url: Some("https://x/license".into()),
            body: Some(LicenseBody::Raw(vec![0x01, 0x02])),
            body_escaped: Some(bytes_to_escaped(&[0x01, 0x02])),
            body_base64: None,
            header_flags: header_flags(headers.iter(), QuoteStyle::Single),
            headers,
            title: Some("Pilot".into()),
        };

        let detail = build_detail_view(TabId(3), &record, QuoteStyle::Single);
        let rendered = flatten(&detail);

        assert_eq!(detail.header, "Tab 3 • ready to send");
        assert!(rendered.contains(&"Body: 2 B".to_string()));
        assert!(rendered.contains(&r"\x01\x02".to_string()));
        assert!(rendered.iter().any(|line| line.contains("| curl 'https://x/license'")));
        assert!(!detail.footer.is_empty());
    }

    #[test]
    fn form_fields_are_listed() {
        let fields = json!({ "token": ["abc", "def"] });
        let record = TabRecord {
            body: Some(LicenseBody::Form(fields.as_object().cloned().unwrap())),
            ..Default::default()
        };

        let rendered = flatten(&build_detail_view(TabId(2), &record, QuoteStyle::Double));
        assert!(rendered.contains(&"Body: 1 form fields".to_string()));
        assert!(rendered.contains(&"token: abc, def".to_string()));
    }

    #[test]
    fn tab_label_prefers_title_then_urls() {
        let mut record = TabRecord::default();
        assert_eq!(tab_label(&record), "(no title yet)");

        record.license_url = Some("https://x/license".into());
        assert_eq!(tab_label(&record), "https://x/license");

        record.title = Some("Pilot".into());
        assert_eq!(tab_label(&record), "Pilot");
    }

    #[test]
    fn formats_sizes() {
        assert_eq!(format_bytes(2), "2 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(truncate("abcdef", 4), "abc…");
    }
}
