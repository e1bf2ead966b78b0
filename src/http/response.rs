//! Response serialisation.
//!
//! # Responsibilities
//! - Render the status line, headers and body of a finished request
//! - Serialise method return values as JSON, XML, HTML or an XML property list
//!
//! # Design Decisions
//! - Return values are always wrapped under a single name so every format has a root
//! - HEAD responses advertise the GET length but carry no body

use serde_json::Value;

use super::request::{ConnectionMode, ContentType, Request, StatusCode, Verb};

pub const SERVER_NAME: &str = concat!("netplane/", env!("CARGO_PKG_VERSION"));

/// Render the response for `request` into wire bytes.
pub fn render(request: &Request) -> Vec<u8> {
    let status = request.status();
    let mut head = format!(
        "{} {} {}\r\n",
        request.protocol().as_str(),
        status.as_u16(),
        status.reason()
    );

    head.push_str(&format!("Server: {SERVER_NAME}\r\n"));
    if request.response_headers().contains("ETag") {
        head.push_str("Cache-Control: no-cache\r\n");
    } else {
        head.push_str("Cache-Control: no-cache, no-store, must-revalidate\r\n");
    }
    match request.connection() {
        ConnectionMode::KeepAlive => head.push_str("Connection: keep-alive\r\n"),
        ConnectionMode::Close => head.push_str("Connection: close\r\n"),
        ConnectionMode::Upgrade => head.push_str("Connection: Upgrade\r\n"),
    }

    if !matches!(status, StatusCode::SwitchingProtocols | StatusCode::NotModified) {
        if let Some(content_type) = request.response_type() {
            head.push_str(&format!("Content-Type: {}; charset=utf-8\r\n", content_type.mime()));
        }
        head.push_str(&format!("Content-Length: {}\r\n", request.response_body().len()));
    }

    for (name, value) in request.response_headers().iter() {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");

    let mut bytes = head.into_bytes();
    if request.verb() != Verb::Head {
        bytes.extend_from_slice(request.response_body());
    }
    bytes
}

/// Serialise `value` wrapped under `name`.
pub fn serialise(content_type: ContentType, name: &str, value: &Value) -> Vec<u8> {
    match content_type {
        ContentType::Json | ContentType::Plain => {
            let mut root = serde_json::Map::new();
            root.insert(name.to_string(), value.clone());
            Value::Object(root).to_string().into_bytes()
        }
        ContentType::Xml => {
            let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
            write_xml(&mut out, name, value);
            out.into_bytes()
        }
        ContentType::Html => {
            let mut out = format!(
                "<!DOCTYPE html><html><head><title>{0}</title></head><body><h1>{0}</h1>",
                escape(name)
            );
            write_html(&mut out, value);
            out.push_str("</body></html>");
            out.into_bytes()
        }
        ContentType::Plist => {
            let mut out = String::from(concat!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>",
                "<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" ",
                "\"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">",
                "<plist version=\"1.0\"><dict>"
            ));
            out.push_str(&format!("<key>{}</key>", escape(name)));
            write_plist(&mut out, value);
            out.push_str("</dict></plist>");
            out.into_bytes()
        }
    }
}

/// Property lists have no null, so it is written as an empty string.
fn write_plist(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("<string/>"),
        Value::Bool(true) => out.push_str("<true/>"),
        Value::Bool(false) => out.push_str("<false/>"),
        Value::Number(n) if n.is_f64() => out.push_str(&format!("<real>{n}</real>")),
        Value::Number(n) => out.push_str(&format!("<integer>{n}</integer>")),
        Value::String(s) => out.push_str(&format!("<string>{}</string>", escape(s))),
        Value::Array(items) => {
            out.push_str("<array>");
            for item in items {
                write_plist(out, item);
            }
            out.push_str("</array>");
        }
        Value::Object(map) => {
            out.push_str("<dict>");
            for (key, item) in map {
                out.push_str(&format!("<key>{}</key>", escape(key)));
                write_plist(out, item);
            }
            out.push_str("</dict>");
        }
    }
}

fn write_xml(out: &mut String, name: &str, value: &Value) {
    let tag = xml_tag(name);
    match value {
        Value::Null => out.push_str(&format!("<{tag}/>")),
        Value::Array(items) => {
            out.push_str(&format!("<{tag}>"));
            for item in items {
                write_xml(out, "item", item);
            }
            out.push_str(&format!("</{tag}>"));
        }
        Value::Object(map) => {
            out.push_str(&format!("<{tag}>"));
            for (key, item) in map {
                write_xml(out, key, item);
            }
            out.push_str(&format!("</{tag}>"));
        }
        Value::String(s) => out.push_str(&format!("<{tag}>{}</{tag}>", escape(s))),
        other => out.push_str(&format!("<{tag}>{other}</{tag}>")),
    }
}

fn write_html(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            out.push_str("<table>");
            for (key, item) in map {
                out.push_str(&format!("<tr><th>{}</th><td>", escape(key)));
                write_html(out, item);
                out.push_str("</td></tr>");
            }
            out.push_str("</table>");
        }
        Value::Array(items) => {
            out.push_str("<ul>");
            for item in items {
                out.push_str("<li>");
                write_html(out, item);
                out.push_str("</li>");
            }
            out.push_str("</ul>");
        }
        Value::String(s) => out.push_str(&escape(s)),
        Value::Null => {}
        other => out.push_str(&other.to_string()),
    }
}

/// XML element names may not start with a digit or contain spaces.
fn xml_tag(name: &str) -> String {
    let mut tag: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' { c } else { '_' })
        .collect();
    if tag.is_empty() || tag.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '.') {
        tag.insert(0, '_');
    }
    tag
}

pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
