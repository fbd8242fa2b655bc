//! File-backed operational state.
//!
//! Four plain files hold the mutable bridge-wide switches: the relay on/off
//! token, the registration open/closed token, and the domain red/green
//! lists (one domain per line, `#` starts a comment). Files are re-read on
//! every access because the other listener process may have rewritten them;
//! every write goes through a temp file plus rename so a concurrent reader
//! never sees a torn file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{cmd, BridgeConfig};

const RED_HEADER: &str = "\
# Domains red-listed for all users (Fediverse and XMPP)
# The red list always has higher priority than the green list
# One domain per line (each subdomain needs its own line); # starts a comment
";

const GREEN_HEADER: &str = "\
# Domains green-listed for all users (Fediverse and XMPP)
# In greenlist mode, only green-listed domain accounts can register
# Otherwise it only waives the minimum-activity check for Fediverse users
# One domain per line (each subdomain needs its own line); # starts a comment
";

/// Which domain list a command operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainList {
    Red,
    Green,
}

/// Handle on the four state files.
#[derive(Debug, Clone)]
pub struct StateFiles {
    start_file: PathBuf,
    open_file: PathBuf,
    dred_file: PathBuf,
    dgreen_file: PathBuf,
    start_token: String,
    stop_token: String,
    open_token: String,
    close_token: String,
}

fn strip_line(line: &str) -> &str {
    line.split('#').next().unwrap_or("").trim()
}

fn write_atomic(path: &Path, content: &str) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)
}

impl StateFiles {
    pub fn new(config: &BridgeConfig) -> StateFiles {
        StateFiles {
            start_file: config.start_file.clone(),
            open_file: config.open_file.clone(),
            dred_file: config.dred_file.clone(),
            dgreen_file: config.dgreen_file.clone(),
            start_token: config.command(cmd::START).to_string(),
            stop_token: config.command(cmd::STOP).to_string(),
            open_token: config.command(cmd::OPEN).to_string(),
            close_token: config.command(cmd::CLOSE).to_string(),
        }
    }

    /// Create any missing file with its default content: relay started,
    /// registration open, empty commented domain lists.
    pub fn ensure_defaults(&self) -> io::Result<()> {
        for (path, content) in [
            (&self.start_file, self.start_token.as_str()),
            (&self.open_file, self.open_token.as_str()),
            (&self.dred_file, RED_HEADER),
            (&self.dgreen_file, GREEN_HEADER),
        ] {
            if !path.exists() {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                write_atomic(path, content)?;
                debug!(path = %path.display(), "state file created");
            }
        }
        Ok(())
    }

    fn path(&self, list: DomainList) -> &Path {
        match list {
            DomainList::Red => &self.dred_file,
            DomainList::Green => &self.dgreen_file,
        }
    }

    /// Current relay token (verbatim file content, trimmed).
    pub fn run_token(&self) -> io::Result<String> {
        Ok(fs::read_to_string(&self.start_file)?.trim().to_string())
    }

    /// Current registration token.
    pub fn reg_token(&self) -> io::Result<String> {
        Ok(fs::read_to_string(&self.open_file)?.trim().to_string())
    }

    /// Whether messages are relayed at all.
    pub fn relay_enabled(&self) -> io::Result<bool> {
        Ok(self.run_token()? != self.stop_token)
    }

    /// Whether new registrations are accepted.
    pub fn registration_open(&self) -> io::Result<bool> {
        Ok(self.reg_token()? != self.close_token)
    }

    /// Store a relay token (the start or stop command word).
    pub fn write_run_token(&self, token: &str) -> io::Result<()> {
        write_atomic(&self.start_file, token)
    }

    /// Store a registration token (the open or close command word).
    pub fn write_reg_token(&self, token: &str) -> io::Result<()> {
        write_atomic(&self.open_file, token)
    }

    /// Domains currently on the list, comments stripped, duplicates kept out.
    pub fn domains(&self, list: DomainList) -> io::Result<Vec<String>> {
        let path = self.path(list);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut out: Vec<String> = Vec::new();
        for line in fs::read_to_string(path)?.lines() {
            let domain = strip_line(line);
            if !domain.is_empty() && !out.iter().any(|d| d == domain) {
                out.push(domain.to_string());
            }
        }
        Ok(out)
    }

    /// True if `domain` is on the list.
    pub fn contains(&self, list: DomainList, domain: &str) -> io::Result<bool> {
        Ok(self.domains(list)?.iter().any(|d| d == domain))
    }

    /// Append a domain. Returns false when it was already listed.
    pub fn add_domain(&self, list: DomainList, domain: &str) -> io::Result<bool> {
        if self.contains(list, domain)? {
            return Ok(false);
        }
        let path = self.path(list);
        let mut content = if path.exists() {
            fs::read_to_string(path)?
        } else {
            String::new()
        };
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(domain);
        content.push('\n');
        write_atomic(path, &content)?;
        Ok(true)
    }

    /// Rewrite the list without the given domains, preserving comment lines.
    /// Returns the subset that was actually present.
    pub fn remove_domains(&self, list: DomainList, domains: &[String]) -> io::Result<Vec<String>> {
        let path = self.path(list);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path)?;
        let mut removed = Vec::new();
        let mut kept = String::with_capacity(content.len());
        for line in content.lines() {
            let entry = strip_line(line);
            if !entry.is_empty() && domains.iter().any(|d| d == entry) {
                if !removed.iter().any(|r| r == entry) {
                    removed.push(entry.to_string());
                }
                continue;
            }
            kept.push_str(line);
            kept.push('\n');
        }
        write_atomic(path, &kept)?;
        Ok(removed)
    }
}
