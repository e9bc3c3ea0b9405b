// ============================================================================
// src/boot_config.rs – Boot entries listed in an installation's config.conf
// ============================================================================

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::layout::CONFIG_FILE;

/// One `[B:<key>]` section of `config.conf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSection {
    pub key: String,
    pub title: Option<String>,
    pub icon: Option<String>,
}

impl BootSection {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            title: None,
            icon: None,
        }
    }

    pub fn display_title(&self) -> String {
        match &self.title {
            Some(title) => title.clone(),
            None => format!("<{}>", self.key),
        }
    }
}

/// Source of the boot entries of an installation directory.
pub trait BootEntries {
    fn load_boot_entries(&self, install_dir: &Path) -> Result<Vec<BootSection>>;
}

/// Reads `<install_dir>/config.conf`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigEntries;

impl BootEntries for ConfigEntries {
    fn load_boot_entries(&self, install_dir: &Path) -> Result<Vec<BootSection>> {
        let path = install_dir.join(CONFIG_FILE);
        let text = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        Ok(parse_sections(&text))
    }
}

/// Parse `config.conf`. Sections keep the order they first appear in;
/// anything unrecognised is logged and skipped.
pub fn parse_sections(text: &str) -> Vec<BootSection> {
    let mut sections: Vec<BootSection> = Vec::new();
    // Index into `sections` of the current boot section, if the current
    // section is one.
    let mut current: Option<Option<usize>> = None;

    for raw in text.lines() {
        let line = match raw.find('#') {
            Some(at) => &raw[..at],
            None => raw,
        }
        .trim();
        if line.is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            debug!(section = name, "config section");
            current = Some(name.strip_prefix("B:").map(|key| {
                match sections.iter().position(|s| s.key == key) {
                    Some(at) => {
                        warn!(key, "duplicate boot section");
                        at
                    }
                    None => {
                        sections.push(BootSection::new(key));
                        sections.len() - 1
                    }
                }
            }));
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            warn!(line, "unrecognised config line");
            continue;
        };
        let Some(section) = current else {
            warn!(key, "setting outside of any section");
            continue;
        };
        let Some(at) = section else {
            continue;
        };
        match key {
            "Title" => sections[at].title = Some(value.to_string()),
            "Icon" => sections[at].icon = Some(value.to_string()),
            _ => {}
        }
    }
    sections
}
