//! Allowlist Store: a durable, text-based list of authorized peers with
//! attributes, supporting crash-safe edits.
//!
//! Line grammar: `<peer-id> (WS+ key=value)* (WS+ "#" comment)?`. Blank lines
//! and lines beginning with `#` are full-line comments and are preserved
//! verbatim on rewrite, as are malformed entry lines a given operation didn't
//! target.

use crate::errors::AllowlistError;
use crate::fsutil;
use crate::peer::PeerId;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A peer's role within the overlay. Absent in the file defaults to
/// [`Role::Member`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    Admin,
    #[default]
    Member,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Admin => "admin",
            Self::Member => "member",
        })
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "member" => Ok(Self::Member),
            _ => Err(()),
        }
    }
}

/// A single allowlist line, fully parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedEntry {
    pub peer_id: PeerId,
    pub comment: Option<String>,
    attrs: BTreeMap<String, String>,
}

impl AuthorizedEntry {
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.attrs
            .get("expires")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    #[must_use]
    pub fn verified(&self) -> Option<&str> {
        self.attrs.get("verified").map(String::as_str)
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.attrs
            .get("role")
            .and_then(|s| Role::from_str(s).ok())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn group(&self) -> Option<&str> {
        self.attrs.get("group").map(String::as_str)
    }

    #[must_use]
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }
}

fn sanitize_comment(s: &str) -> String {
    s.chars().filter(|c| !matches!(c, '\n' | '\r' | '\0')).collect()
}

/// Classification of one physical line in the allowlist file.
enum Line {
    /// Blank line or a line starting with `#`: preserved verbatim.
    Verbatim(String),
    /// A non-comment line, along with the raw leading token that identifies
    /// the peer it's about (used for matching even if the rest is malformed).
    Entry { raw: String, peer_token: String },
}

fn classify(raw_line: &str) -> Line {
    let trimmed = raw_line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Line::Verbatim(raw_line.to_owned());
    }
    let peer_token = trimmed.split_whitespace().next().unwrap_or("").to_owned();
    Line::Entry {
        raw: raw_line.to_owned(),
        peer_token,
    }
}

/// Parses one non-comment line into `(peer_token, attrs, comment)`. Returns
/// `Err` if an attribute token has no `=`, or a key repeats within the line.
fn parse_entry_body(raw: &str) -> Result<(String, BTreeMap<String, String>, Option<String>), String> {
    let trimmed = raw.trim_start();
    let (peer_token, mut rest) = match trimmed.find(char::is_whitespace) {
        Some(idx) => (trimmed[..idx].to_owned(), trimmed[idx..].trim_start()),
        None => (trimmed.trim_end().to_owned(), ""),
    };

    let mut attrs = BTreeMap::new();
    let mut comment = None;

    loop {
        if rest.is_empty() {
            break;
        }
        if let Some(stripped) = rest.strip_prefix('#') {
            comment = Some(stripped.trim().to_owned());
            break;
        }
        let (token, remainder) = match rest.find(char::is_whitespace) {
            Some(idx) => (&rest[..idx], rest[idx..].trim_start()),
            None => (rest.trim_end(), ""),
        };
        let Some((k, v)) = token.split_once('=') else {
            return Err(format!("malformed attribute token: {token}"));
        };
        if attrs.contains_key(k) {
            return Err(format!("duplicate attribute key: {k}"));
        }
        attrs.insert(k.to_owned(), v.to_owned());
        rest = remainder;
    }

    Ok((peer_token, attrs, comment))
}

fn render_entry(peer_id: &PeerId, attrs: &BTreeMap<String, String>, comment: Option<&str>) -> String {
    let mut out = peer_id.as_str().to_owned();

    if let Some(v) = attrs.get("expires") {
        out.push_str("  expires=");
        out.push_str(v);
    }
    if let Some(v) = attrs.get("verified") {
        out.push_str("  verified=");
        out.push_str(v);
    }
    for (k, v) in attrs {
        if k == "expires" || k == "verified" {
            continue;
        }
        out.push_str("  ");
        out.push_str(k);
        out.push('=');
        out.push_str(v);
    }
    if let Some(c) = comment {
        if !c.is_empty() {
            out.push_str("  # ");
            out.push_str(c);
        }
    }
    out
}

fn read_lines(path: &Path) -> Result<Vec<String>, std::io::Error> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(s.lines().map(str::to_owned).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn write_lines(path: &Path, lines: &[String]) -> Result<(), std::io::Error> {
    let mut body = lines.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    fsutil::write_string_atomic_restrictive(path, &body, fsutil::MODE_FILE_PRIVATE)
        .map_err(|e| std::io::Error::other(e.to_string()))
}

/// A handle to the allowlist file at a fixed path.
#[derive(Debug, Clone)]
pub struct AllowlistStore {
    path: PathBuf,
}

impl AllowlistStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Strict load: returns the set of authorized peers. Fails on any
    /// malformed non-comment line.
    pub fn load(&self) -> Result<std::collections::HashSet<PeerId>, AllowlistError> {
        let mut out = std::collections::HashSet::new();
        for raw in read_lines(&self.path)? {
            if let Line::Entry { raw, peer_token } = classify(&raw) {
                let peer_id = PeerId::parse(&peer_token)
                    .map_err(|e| AllowlistError::InvalidPeerId(format!("{peer_token}: {e}")))?;
                parse_entry_body(&raw).map_err(AllowlistError::InvalidPeerId)?;
                out.insert(peer_id);
            }
        }
        Ok(out)
    }

    /// Lenient listing: invalid lines are skipped, not removed. Missing file
    /// returns empty.
    pub fn list(&self) -> Result<Vec<AuthorizedEntry>, AllowlistError> {
        let mut out = Vec::new();
        for raw in read_lines(&self.path)? {
            let Line::Entry { raw, peer_token } = classify(&raw) else {
                continue;
            };
            let Ok(peer_id) = PeerId::parse(&peer_token) else {
                continue;
            };
            let Ok((_, attrs, comment)) = parse_entry_body(&raw) else {
                continue;
            };
            out.push(AuthorizedEntry {
                peer_id,
                comment,
                attrs,
            });
        }
        Ok(out)
    }

    /// Appends a new entry. Fails if the peer is already present.
    pub fn add(&self, peer_id: &PeerId, comment: Option<&str>) -> Result<(), AllowlistError> {
        let mut lines = read_lines(&self.path)?;
        for raw in &lines {
            if let Line::Entry { peer_token, .. } = classify(raw) {
                if peer_token == peer_id.as_str() {
                    return Err(AllowlistError::PeerAlreadyAuthorized);
                }
            }
        }
        let comment = comment.map(sanitize_comment);
        lines.push(render_entry(peer_id, &BTreeMap::new(), comment.as_deref()));
        write_lines(&self.path, &lines)?;
        Ok(())
    }

    /// Removes the target peer's line, preserving every other line
    /// (including malformed ones) byte-for-byte.
    pub fn remove(&self, peer_id: &PeerId) -> Result<(), AllowlistError> {
        let lines = read_lines(&self.path)?;
        let mut found = false;
        let kept: Vec<String> = lines
            .into_iter()
            .filter(|raw| match classify(raw) {
                Line::Entry { peer_token, .. } if peer_token == peer_id.as_str() => {
                    found = true;
                    false
                }
                _ => true,
            })
            .collect();
        if !found {
            return Err(AllowlistError::PeerNotFound);
        }
        write_lines(&self.path, &kept)?;
        Ok(())
    }

    /// Sets (or, with an empty value, deletes) one attribute on the target
    /// peer's line. Other lines are untouched.
    pub fn set_attr(&self, peer_id: &PeerId, key: &str, value: &str) -> Result<(), AllowlistError> {
        let lines = read_lines(&self.path)?;
        let mut found = false;
        let mut out = Vec::with_capacity(lines.len());
        for raw in lines {
            match classify(&raw) {
                Line::Entry { raw, peer_token } if peer_token == peer_id.as_str() => {
                    found = true;
                    let (_, mut attrs, comment) =
                        parse_entry_body(&raw).unwrap_or((peer_token, BTreeMap::new(), None));
                    if value.is_empty() {
                        attrs.remove(key);
                    } else {
                        attrs.insert(key.to_owned(), value.to_owned());
                    }
                    out.push(render_entry(peer_id, &attrs, comment.as_deref()));
                }
                Line::Entry { raw, .. } => out.push(raw),
                Line::Verbatim(raw) => out.push(raw),
            }
        }
        if !found {
            return Err(AllowlistError::PeerNotFound);
        }
        write_lines(&self.path, &out)?;
        Ok(())
    }

    /// Returns the peer's role, defaulting to [`Role::Member`] when the
    /// `role` attribute is absent or the peer itself is absent.
    pub fn get_role(&self, peer_id: &PeerId) -> Result<Role, AllowlistError> {
        Ok(self
            .list()?
            .into_iter()
            .find(|e| &e.peer_id == peer_id)
            .map(|e| e.role())
            .unwrap_or_default())
    }

    pub fn set_role(&self, peer_id: &PeerId, role: Role) -> Result<(), AllowlistError> {
        self.set_attr(peer_id, "role", &role.to_string())
    }

    pub fn count_admins(&self) -> Result<usize, AllowlistError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|e| e.role() == Role::Admin)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> PeerId {
        PeerId::parse(s).unwrap()
    }

    #[test]
    fn round_trip_preserves_comments_and_attrs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowlist.txt");
        std::fs::write(
            &path,
            "# header\n\
             PID_A  expires=2026-03-15T00:00:00Z  # contractor\n\
             PID_B  verified=sha256:abc123  # mum\n",
        )
        .unwrap();
        let store = AllowlistStore::new(&path);

        let entries = store.list().unwrap();
        assert_eq!(entries.len(), 2);
        let a = entries.iter().find(|e| e.peer_id == pid("PID_A")).unwrap();
        assert_eq!(a.expires_at().unwrap().format("%Y").to_string(), "2026");
        assert_eq!(a.comment.as_deref(), Some("contractor"));
        let b = entries.iter().find(|e| e.peer_id == pid("PID_B")).unwrap();
        assert_eq!(b.verified(), Some("sha256:abc123"));
        assert_eq!(b.comment.as_deref(), Some("mum"));

        store.set_attr(&pid("PID_B"), "verified", "").unwrap();
        let entries = store.list().unwrap();
        let b = entries.iter().find(|e| e.peer_id == pid("PID_B")).unwrap();
        assert_eq!(b.verified(), None);
        assert_eq!(b.comment.as_deref(), Some("mum"));

        store.remove(&pid("PID_A")).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with("# header\n"));
        assert!(!raw.contains("PID_A"));
    }

    #[test]
    fn add_rejects_duplicate_and_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowlist.txt");
        let store = AllowlistStore::new(&path);

        store.add(&pid("PID_A"), Some("first")).unwrap();
        let err = store.add(&pid("PID_A"), None).unwrap_err();
        assert!(matches!(err, AllowlistError::PeerAlreadyAuthorized));
    }

    #[test]
    fn comment_is_sanitized_of_control_chars() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowlist.txt");
        let store = AllowlistStore::new(&path);
        store.add(&pid("PID_A"), Some("line1\nline2\r\0")).unwrap();
        let entries = store.list().unwrap();
        assert_eq!(entries[0].comment.as_deref(), Some("line1line2"));
    }

    #[test]
    fn remove_preserves_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowlist.txt");
        std::fs::write(&path, "PID_A\nPID_B bad_attr_no_equals\n").unwrap();
        let store = AllowlistStore::new(&path);
        store.remove(&pid("PID_A")).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw, "PID_B bad_attr_no_equals\n");
    }

    #[test]
    fn load_is_strict_about_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowlist.txt");
        std::fs::write(&path, "PID_A bad_attr_no_equals\n").unwrap();
        let store = AllowlistStore::new(&path);
        assert!(store.load().is_err());
        // list() is lenient: the malformed line is skipped, not erroring.
        assert_eq!(store.list().unwrap().len(), 0);
    }

    #[test]
    fn role_defaults_to_member() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowlist.txt");
        let store = AllowlistStore::new(&path);
        store.add(&pid("PID_A"), None).unwrap();
        assert_eq!(store.get_role(&pid("PID_A")).unwrap(), Role::Member);
        store.set_role(&pid("PID_A"), Role::Admin).unwrap();
        assert_eq!(store.get_role(&pid("PID_A")).unwrap(), Role::Admin);
        assert_eq!(store.count_admins().unwrap(), 1);
    }
}
