//! Heuristic user-agent parser.
//!
//! Recognises the common browser, OS and crawler tokens. Anything else is
//! reported as `Other`.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUserAgent {
    pub ua_family: String,
    pub ua_version: Option<String>,
    pub os_family: String,
    pub device_family: String,
    pub bot: bool,
}

const OTHER: &str = "Other";

const BOT_MARKERS: &[&str] = &["bot", "crawler", "spider", "slurp", "headless"];

// Order matters: Edge and Opera also carry a Chrome token, Chrome carries Safari.
const BROWSERS: &[(&str, &str)] = &[
    ("Edg/", "Edge"),
    ("OPR/", "Opera"),
    ("SamsungBrowser/", "Samsung Internet"),
    ("Firefox/", "Firefox"),
    ("CriOS/", "Chrome Mobile iOS"),
    ("Chrome/", "Chrome"),
    ("Trident/", "IE"),
    ("MSIE ", "IE"),
];

const OPERATING_SYSTEMS: &[(&str, &str)] = &[
    ("Windows", "Windows"),
    ("Android", "Android"),
    ("iPhone", "iOS"),
    ("iPad", "iOS"),
    ("CrOS", "Chrome OS"),
    ("Mac OS X", "Mac OS X"),
    ("Linux", "Linux"),
];

pub fn parse(user_agent: &str) -> ParsedUserAgent {
    let lower = user_agent.to_ascii_lowercase();
    let bot = BOT_MARKERS.iter().any(|m| lower.contains(m));

    let (ua_family, ua_version) = browser(user_agent);
    let os_family = OPERATING_SYSTEMS
        .iter()
        .find(|(token, _)| user_agent.contains(token))
        .map(|(_, family)| family.to_string())
        .unwrap_or_else(|| OTHER.to_string());

    let device_family = if bot {
        "Spider"
    } else if user_agent.contains("iPhone") {
        "iPhone"
    } else if user_agent.contains("iPad") {
        "iPad"
    } else if user_agent.contains("Mobile") {
        "Smartphone"
    } else if os_family == "Android" {
        "Tablet"
    } else if os_family == OTHER {
        OTHER
    } else {
        "Desktop"
    }
    .to_string();

    ParsedUserAgent {
        ua_family,
        ua_version,
        os_family,
        device_family,
        bot,
    }
}

fn browser(user_agent: &str) -> (String, Option<String>) {
    for (token, family) in BROWSERS {
        if let Some(pos) = user_agent.find(token) {
            let version = version_after(&user_agent[pos + token.len()..]);
            return (family.to_string(), version);
        }
    }
    if user_agent.contains("Safari/") {
        let version = user_agent
            .find("Version/")
            .and_then(|pos| version_after(&user_agent[pos + "Version/".len()..]));
        return ("Safari".to_string(), version);
    }
    (OTHER.to_string(), None)
}

fn version_after(rest: &str) -> Option<String> {
    let version: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let version = version.trim_end_matches('.');
    (!version.is_empty()).then(|| version.to_string())
}

impl ParsedUserAgent {
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("ua_family".to_string(), Value::from(self.ua_family.clone()));
        if let Some(v) = &self.ua_version {
            map.insert("ua_version".to_string(), Value::from(v.clone()));
        }
        map.insert("os_family".to_string(), Value::from(self.os_family.clone()));
        map.insert(
            "device_family".to_string(),
            Value::from(self.device_family.clone()),
        );
        map.insert("bot".to_string(), Value::Bool(self.bot));
        Value::Object(map)
    }
}
