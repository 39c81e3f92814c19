//! # Status Header Formatter
//!
//! Every tool response, success or error, is prefixed with a one-line
//! connection summary so the agent always sees current state. This module
//! is a pure function of its inputs: it reads no shared state and owns no
//! locks, so the same inputs always produce the same header.

use bridge_protocol::TabInfo;

use crate::connection::LinkState;

/// Separator appended after the header line.
const SEPARATOR: &str = "\n---\n\n";

/// Maximum rendered URL length before truncation.
const URL_MAX: usize = 50;

/// Everything the formatter is allowed to look at.
#[derive(Debug, Clone, Default)]
pub struct StatusInputs {
    pub state: LinkState,
    pub version: String,
    pub debug: bool,
    pub browser_name: Option<String>,
    pub attached_tab: Option<TabInfo>,
    pub stealth: bool,
}

/// Renders the pipe-delimited status header.
///
/// Passive: `🔴 v<ver> | Disabled`. Enabled states: `✅ v<ver>` followed
/// by browser, attached-tab, tech-stack and stealth segments, each omitted
/// when its source data is absent. Always terminated by `\n---\n\n`.
pub fn format_header(inputs: &StatusInputs) -> String {
    if inputs.state == LinkState::Passive {
        return format!("🔴 v{} | Disabled{}", inputs.version, SEPARATOR);
    }

    let mut segments = vec![format!("✅ v{}", inputs.version)];

    if let Some(browser) = &inputs.browser_name {
        segments.push(format!("🌐 {}", browser));
    }

    if let Some(tab) = &inputs.attached_tab {
        let location = tab.url.as_deref().or(tab.title.as_deref());
        match location {
            Some(loc) => segments.push(format!("📄 Tab {}: {}", tab.index, truncate_url(loc))),
            None => segments.push(format!("📄 Tab {}", tab.index)),
        }
        if let Some(tech) = &tab.tech_stack {
            segments.push(format!("🔧 {}", tech));
        }
    }

    if inputs.stealth {
        segments.push("🕵️ Stealth".to_string());
    }

    if inputs.debug {
        segments.push("🐛 Debug".to_string());
    }

    format!("{}{}", segments.join(" | "), SEPARATOR)
}

fn truncate_url(url: &str) -> String {
    if url.chars().count() <= URL_MAX {
        url.to_string()
    } else {
        let head: String = url.chars().take(URL_MAX - 3).collect();
        format!("{}...", head)
    }
}
