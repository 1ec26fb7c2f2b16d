//! Markdown rendering of contracts.
//!
//! A contract document is readable by humans and workers, and parses back
//! into exactly the contract it was rendered from. Free text (entry content
//! and code samples) is written with a byte-length prefix so it may contain
//! anything, including markdown of its own.
//!
//! ```text
//! # Contract: User API
//!
//! - ID: 5f0c...
//! - Type: api
//! - Status: AGREED
//! - Proposer: T2
//! ...
//!
//! ## Negotiation History
//!
//! ### 1. proposal by T2 at 2026-03-01T10:00:00Z
//! - Transition: NEGOTIATING
//! - Content: 14 bytes
//! GET /users/:id
//! ```

use crate::core::{Contract, ContractId, ContractStatus, NegotiationAction, NegotiationEntry};
use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::fmt::Write as _;

const TITLE_PREFIX: &str = "# Contract: ";
const HISTORY_HEADING: &str = "## Negotiation History";
const ENTRY_PREFIX: &str = "### ";

fn ts(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_ts(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Document(format!("bad timestamp '{}': {}", text, e)))
}

fn field(out: &mut String, key: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "- {}: {}", key, value);
}

fn block(out: &mut String, key: &str, text: &str) {
    let _ = writeln!(out, "- {}: {} bytes", key, text.len());
    out.push_str(text);
    out.push('\n');
}

/// Render a contract as a markdown document.
pub fn render(contract: &Contract) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}{}", TITLE_PREFIX, contract.name);
    out.push('\n');
    field(&mut out, "ID", contract.id);
    field(&mut out, "Type", &contract.contract_type);
    field(&mut out, "Status", contract.status);
    field(&mut out, "Proposer", &contract.proposer);
    if let Some(implementer) = &contract.implementer {
        field(&mut out, "Implementer", implementer);
    }
    field(&mut out, "Created", ts(&contract.created_at));
    field(&mut out, "Updated", ts(&contract.updated_at));
    if let Some(t) = &contract.agreed_at {
        field(&mut out, "Agreed", ts(t));
    }
    if let Some(t) = &contract.implemented_at {
        field(&mut out, "Implemented", ts(t));
    }
    if let Some(t) = &contract.verified_at {
        field(&mut out, "Verified", ts(t));
    }
    if let Some(path) = &contract.implementation_path {
        field(&mut out, "Implementation", path);
    }
    if !contract.tags.is_empty() {
        field(&mut out, "Tags", contract.tags.join(", "));
    }
    if !contract.dependencies.is_empty() {
        let deps: Vec<String> = contract.dependencies.iter().map(ToString::to_string).collect();
        field(&mut out, "Dependencies", deps.join(", "));
    }

    out.push('\n');
    out.push_str(HISTORY_HEADING);
    out.push('\n');
    for (i, entry) in contract.history.iter().enumerate() {
        out.push('\n');
        let _ = writeln!(
            out,
            "{}{}. {} by {} at {}",
            ENTRY_PREFIX,
            i + 1,
            entry.action,
            entry.worker,
            ts(&entry.timestamp)
        );
        if let Some(quality) = entry.quality {
            field(&mut out, "Quality", format!("{}%", quality));
        }
        if let Some(status) = entry.transition {
            field(&mut out, "Transition", status);
        }
        if !entry.metadata.is_empty() {
            let json = serde_json::to_string(&entry.metadata).unwrap_or_default();
            field(&mut out, "Metadata", json);
        }
        block(&mut out, "Content", &entry.content);
        if let Some(code) = &entry.code {
            block(&mut out, "Code", code);
        }
    }
    out
}

/// Byte cursor over a document.
struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn peek_line(&self) -> Option<&'a str> {
        if self.at_end() {
            return None;
        }
        let rest = &self.text[self.pos..];
        Some(rest.split('\n').next().unwrap_or(rest))
    }

    fn next_line(&mut self) -> Option<&'a str> {
        let line = self.peek_line()?;
        self.pos = (self.pos + line.len() + 1).min(self.text.len());
        Some(line)
    }

    fn skip_blank(&mut self) {
        while self.peek_line().is_some_and(|l| l.trim().is_empty()) {
            self.next_line();
        }
    }

    /// Exactly `len` bytes followed by a newline.
    fn take_block(&mut self, len: usize) -> Result<&'a str> {
        let end = self.pos + len;
        let body = self
            .text
            .get(self.pos..end)
            .ok_or_else(|| Error::Document(format!("block of {} bytes runs past the end", len)))?;
        if self.text.as_bytes().get(end) != Some(&b'\n') {
            return Err(Error::Document("block is not followed by a newline".to_string()));
        }
        self.pos = end + 1;
        Ok(body)
    }
}

fn split_field(line: &str) -> Option<(&str, &str)> {
    line.strip_prefix("- ")?.split_once(": ")
}

fn block_len(value: &str) -> Result<usize> {
    value
        .strip_suffix(" bytes")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| Error::Document(format!("bad block length '{}'", value)))
}

fn parse_status(value: &str) -> Result<ContractStatus> {
    value.parse().map_err(Error::Document)
}

fn parse_id(value: &str) -> Result<ContractId> {
    value
        .parse()
        .map_err(|e| Error::Document(format!("bad contract id '{}': {}", value, e)))
}

/// Parse a document produced by [`render`].
pub fn parse(text: &str) -> Result<Contract> {
    let mut cursor = Cursor::new(text);
    cursor.skip_blank();
    let name = cursor
        .next_line()
        .and_then(|l| l.strip_prefix(TITLE_PREFIX))
        .ok_or_else(|| Error::Document("missing '# Contract:' title".to_string()))?
        .to_string();

    let mut header: BTreeMap<&str, &str> = BTreeMap::new();
    loop {
        cursor.skip_blank();
        match cursor.next_line() {
            Some(HISTORY_HEADING) => break,
            Some(line) => {
                let (key, value) = split_field(line)
                    .ok_or_else(|| Error::Document(format!("bad header line '{}'", line)))?;
                header.insert(key, value);
            }
            None => return Err(Error::Document("missing negotiation history".to_string())),
        }
    }
    let required = |key: &str| {
        header
            .get(key)
            .copied()
            .ok_or_else(|| Error::Document(format!("missing header field '{}'", key)))
    };
    let optional_ts = |key: &str| header.get(key).map(|v| parse_ts(v)).transpose();

    let mut history = Vec::new();
    loop {
        cursor.skip_blank();
        if cursor.at_end() {
            break;
        }
        history.push(parse_entry(&mut cursor)?);
    }

    Ok(Contract {
        id: parse_id(required("ID")?)?,
        name,
        contract_type: required("Type")?.to_string(),
        proposer: required("Proposer")?.to_string(),
        implementer: header.get("Implementer").map(|v| v.to_string()),
        status: parse_status(required("Status")?)?,
        history,
        tags: header
            .get("Tags")
            .map(|v| v.split(", ").map(str::to_string).collect())
            .unwrap_or_default(),
        dependencies: header
            .get("Dependencies")
            .map(|v| v.split(", ").map(parse_id).collect::<Result<Vec<_>>>())
            .transpose()?
            .unwrap_or_default(),
        implementation_path: header.get("Implementation").map(|v| v.to_string()),
        created_at: parse_ts(required("Created")?)?,
        updated_at: parse_ts(required("Updated")?)?,
        agreed_at: optional_ts("Agreed")?,
        implemented_at: optional_ts("Implemented")?,
        verified_at: optional_ts("Verified")?,
    })
}

fn parse_entry(cursor: &mut Cursor<'_>) -> Result<NegotiationEntry> {
    let line = cursor.next_line().unwrap_or_default();
    let heading = line
        .strip_prefix(ENTRY_PREFIX)
        .ok_or_else(|| Error::Document(format!("expected entry heading, got '{}'", line)))?;
    let bad = || Error::Document(format!("bad entry heading '{}'", line));
    let (rest, timestamp) = heading.rsplit_once(" at ").ok_or_else(bad)?;
    let (_, rest) = rest.split_once(". ").ok_or_else(bad)?;
    let (action, worker) = rest.split_once(" by ").ok_or_else(bad)?;

    let mut entry = NegotiationEntry::new(
        worker,
        action
            .parse::<NegotiationAction>()
            .map_err(Error::Document)?,
        "",
    );
    entry.timestamp = parse_ts(timestamp)?;

    let mut saw_content = false;
    while let Some(line) = cursor.peek_line() {
        let Some((key, value)) = split_field(line) else {
            break;
        };
        cursor.next_line();
        match key {
            "Quality" => {
                let pct = value
                    .strip_suffix('%')
                    .and_then(|n| n.parse::<u8>().ok())
                    .ok_or_else(|| Error::Document(format!("bad quality '{}'", value)))?;
                entry.quality = Some(pct);
            }
            "Transition" => entry.transition = Some(parse_status(value)?),
            "Metadata" => entry.metadata = serde_json::from_str(value)?,
            "Content" => {
                entry.content = cursor.take_block(block_len(value)?)?.to_string();
                saw_content = true;
            }
            "Code" => entry.code = Some(cursor.take_block(block_len(value)?)?.to_string()),
            other => {
                return Err(Error::Document(format!("unknown entry field '{}'", other)));
            }
        }
        if key == "Code" {
            break;
        }
    }
    if !saw_content {
        return Err(Error::Document(format!("entry '{}' has no content", heading)));
    }
    Ok(entry)
}
