//! Test message construction and identifier header handling.
//!
//! A [`MessageTemplate`] is built once per run, either generated from the
//! subject/from/to/size options or parsed from a raw RFC 5322 file. Every send
//! task clones the template and stamps its own identifier header into the clone,
//! so no message object is ever shared between tasks.

use std::path::Path;

use chrono::Utc;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::ids::MessageId;

/// Line length used when wrapping generated bodies
const BODY_LINE_LENGTH: usize = 76;

/// SMTP envelope derived from the message headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: String,
    pub recipients: Vec<String>,
}

/// Header list plus body of a test message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    headers: Vec<(String, String)>,
    body: String,
}

impl MessageTemplate {
    /// Build a `text/plain` message whose body is `size` `x` characters.
    pub fn generate(subject: &str, from: &str, to: &str, size: usize) -> Self {
        let domain = extract_addresses(from)
            .first()
            .and_then(|address| address.rsplit_once('@').map(|(_, d)| d.to_string()))
            .unwrap_or_else(|| "localhost".to_string());

        let headers = vec![
            ("Date".to_string(), Utc::now().to_rfc2822()),
            ("From".to_string(), from.to_string()),
            ("To".to_string(), to.to_string()),
            (
                "Message-ID".to_string(),
                format!("<{}@{}>", Uuid::new_v4(), domain),
            ),
            ("Subject".to_string(), subject.to_string()),
            ("MIME-Version".to_string(), "1.0".to_string()),
            (
                "Content-Type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            ),
            ("Content-Transfer-Encoding".to_string(), "7bit".to_string()),
        ];

        let mut body = String::with_capacity(size + 2 * (size / BODY_LINE_LENGTH + 1));
        let mut remaining = size;
        while remaining > 0 {
            let line = remaining.min(BODY_LINE_LENGTH);
            body.extend(std::iter::repeat('x').take(line));
            body.push_str("\r\n");
            remaining -= line;
        }

        Self { headers, body }
    }

    /// Parse a raw message. Folded header lines are unfolded; LF and CRLF line
    /// endings are both accepted.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut lines = raw.split('\n');
        let mut body_lines = Vec::new();
        let mut in_body = false;

        for line in lines.by_ref() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                in_body = true;
                break;
            }
            if line.starts_with([' ', '\t']) {
                let Some((_, value)) = headers.last_mut() else {
                    return Err(ConfigError::MalformedMessage(
                        "continuation line before first header".to_string(),
                    ));
                };
                value.push(' ');
                value.push_str(line.trim());
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(ConfigError::MalformedMessage(format!(
                    "header line without colon: {:?}",
                    line
                )));
            };
            if !is_valid_header_name(name) {
                return Err(ConfigError::MalformedMessage(format!(
                    "invalid header name: {:?}",
                    name
                )));
            }
            headers.push((name.to_string(), value.trim().to_string()));
        }

        if headers.is_empty() {
            return Err(ConfigError::MalformedMessage("no headers".to_string()));
        }

        if in_body {
            for line in lines {
                body_lines.push(line.strip_suffix('\r').unwrap_or(line));
            }
        }
        // A trailing newline in the file yields one empty trailing element
        if body_lines.last() == Some(&"") {
            body_lines.pop();
        }
        let mut body = String::new();
        for line in body_lines {
            body.push_str(line);
            body.push_str("\r\n");
        }

        Ok(Self { headers, body })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path).map_err(|source| ConfigError::MessageFile {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&String::from_utf8_lossy(&raw))
    }

    /// First value of header `name`, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace every occurrence of header `name` with a single value, or append it.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(first) => {
                self.headers[first].1 = value.to_string();
                let mut index = 0;
                self.headers.retain(|(n, _)| {
                    let keep = index <= first || !n.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
            }
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Sender from `From` and recipients from `To`, `Cc` and `Bcc`
    pub fn envelope(&self) -> Result<Envelope, ConfigError> {
        let from = self
            .header("From")
            .and_then(|value| extract_addresses(value).into_iter().next())
            .ok_or(ConfigError::MissingEnvelope("sender"))?;

        let recipients: Vec<String> = self
            .headers
            .iter()
            .filter(|(n, _)| {
                n.eq_ignore_ascii_case("To")
                    || n.eq_ignore_ascii_case("Cc")
                    || n.eq_ignore_ascii_case("Bcc")
            })
            .flat_map(|(_, v)| extract_addresses(v))
            .collect();

        if recipients.is_empty() {
            return Err(ConfigError::MissingEnvelope("recipient"));
        }
        Ok(Envelope { from, recipients })
    }

    /// Wire form with CRLF line endings
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 64 * self.headers.len());
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(self.body.as_bytes());
        out
    }
}

/// Header names are printable ASCII without colon
pub fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| (33..=126).contains(&b) && b != b':')
}

/// Decimal string form carried in the identifier header
pub fn encode_message_id(id: MessageId) -> String {
    id.to_string()
}

/// Parse an identifier header value: ASCII decimal, no sign, no leading zeros.
pub fn parse_message_id(value: &str) -> Option<MessageId> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if value.len() > 1 && value.starts_with('0') {
        return None;
    }
    value.parse().ok()
}

/// Value of header `name` in a raw message, looking only at the header section
pub fn extract_header(raw: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let mut found: Option<String> = None;

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            break;
        }
        if line.starts_with([' ', '\t']) {
            if let Some(value) = found.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if found.is_some() {
            break;
        }
        if let Some((n, v)) = line.split_once(':') {
            if n.eq_ignore_ascii_case(name) {
                found = Some(v.trim().to_string());
            }
        }
    }

    found
}

/// Bare addresses from an address-list header value
fn extract_addresses(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut angle = false;

    for c in value.chars() {
        match c {
            '"' if !angle => quoted = !quoted,
            '<' if !quoted => angle = true,
            '>' if !quoted => angle = false,
            ',' if !quoted && !angle => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    parts.push(current);

    parts
        .iter()
        .filter_map(|part| {
            let address = match (part.find('<'), part.rfind('>')) {
                (Some(start), Some(end)) if start < end => &part[start + 1..end],
                _ => part.as_str(),
            };
            let address = address.trim();
            (!address.is_empty()).then(|| address.to_string())
        })
        .collect()
}
