//! User-Agent string sent with every API request.

/// Project URL for User-Agent identification (good citizenship; RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/fierce/harvester";

/// Default User-Agent (identifies the tool and its version).
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("harvester/{version} (academic-research-tool; +{PROJECT_UA_URL})")
}
