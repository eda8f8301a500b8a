use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use super::StructuredParser;
use crate::device::Platform;

macro_rules! lazy_regex {
    ($name:ident, $re:expr) => {
        static $name: Lazy<Regex> = Lazy::new(|| match Regex::new($re) {
            Ok(re) => re,
            Err(err) => panic!("invalid {} regex: {err}", stringify!($name)),
        });
    };
}

lazy_regex!(IOS_VERSION, r"(?m)^Cisco IOS.*?Software.*?, Version ([^,\s]+)");
lazy_regex!(XR_VERSION, r"(?m)^Cisco IOS XR Software, Version ([^\s\[]+)");
lazy_regex!(UPTIME, r"(?m)^(\S+) uptime is (.+?)\s*$");
lazy_regex!(SERIAL, r"(?m)^Processor board ID (\S+)");
lazy_regex!(IMAGE, r#"(?m)^System image file is "([^"]+)""#);
lazy_regex!(MODEL, r"(?m)^cisco (\S+)(?: \([^)]*\))? (?:processor|Chassis)");

/// Parsers shipped with the crate.
///
/// Only `show version` is parsed structurally; table-shaped outputs are left
/// to [`TemplateLibrary`](super::TemplateLibrary).
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinParsers;

impl StructuredParser for BuiltinParsers {
    fn name(&self) -> &str {
        "builtin"
    }

    fn parse(&self, platform: Platform, key: &str, raw: &str) -> Option<Result<Value, String>> {
        match key {
            "show version" => Some(parse_show_version(platform, raw)),
            _ => None,
        }
    }
}

fn capture(re: &Regex, raw: &str, group: usize) -> Option<String> {
    re.captures(raw)
        .and_then(|caps| caps.get(group))
        .map(|m| m.as_str().to_string())
}

fn parse_show_version(platform: Platform, raw: &str) -> Result<Value, String> {
    let version_re = match platform {
        Platform::IosXr => &*XR_VERSION,
        Platform::Ios | Platform::IosXe => &*IOS_VERSION,
    };
    let version = capture(version_re, raw, 1)
        .ok_or_else(|| "software version line not found".to_string())?;

    let mut map = Map::new();
    map.insert("platform".to_string(), Value::String(platform.to_string()));
    map.insert("version".to_string(), Value::String(version));
    if let Some(caps) = UPTIME.captures(raw) {
        map.insert("hostname".to_string(), Value::String(caps[1].to_string()));
        map.insert("uptime".to_string(), Value::String(caps[2].to_string()));
    }
    for (field, re) in [("serial", &*SERIAL), ("image", &*IMAGE), ("model", &*MODEL)] {
        if let Some(value) = capture(re, raw, 1) {
            map.insert(field.to_string(), Value::String(value));
        }
    }
    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const IOS_XE: &str = r#"Cisco IOS XE Software, Version 17.03.04a
Cisco IOS Software [Amsterdam], ASR1000 Software (X86_64_LINUX_IOSD-UNIVERSALK9-M), Version 17.3.4a, RELEASE SOFTWARE (fc3)
pe-edge-2 uptime is 3 weeks, 1 day, 4 hours, 12 minutes
System image file is "bootflash:asr1000-universalk9.17.03.04a.SPA.bin"
cisco ASR1001-X (1NG) processor (revision 1NG) with 3752937K/6147K bytes of memory.
Processor board ID FXS2012Q0AB"#;

    const XR: &str = r#"Cisco IOS XR Software, Version 6.5.3[Default]
Copyright (c) 2013-2019 by Cisco Systems, Inc.

ROM: System Bootstrap, Version 12.0(20180209:064446) [ASR9K ROMMON],

p1 uptime is 12 weeks, 6 days, 23 hours, 4 minutes"#;

    #[test]
    fn parses_ios_xe_show_version() {
        let value = parse_show_version(Platform::IosXe, IOS_XE).expect("parse");
        assert_eq!(value["version"], json!("17.03.04a"));
        assert_eq!(value["hostname"], json!("pe-edge-2"));
        assert_eq!(value["serial"], json!("FXS2012Q0AB"));
        assert_eq!(value["model"], json!("ASR1001-X"));
        assert_eq!(
            value["image"],
            json!("bootflash:asr1000-universalk9.17.03.04a.SPA.bin")
        );
    }

    #[test]
    fn parses_xr_show_version() {
        let value = parse_show_version(Platform::IosXr, XR).expect("parse");
        assert_eq!(value["version"], json!("6.5.3"));
        assert_eq!(value["uptime"], json!("12 weeks, 6 days, 23 hours, 4 minutes"));
        assert!(value.get("serial").is_none());
    }

    #[test]
    fn missing_version_line_is_an_error() {
        let parsed = BuiltinParsers.parse(Platform::Ios, "show version", "garbage");
        assert!(matches!(parsed, Some(Err(_))));
        assert!(BuiltinParsers.parse(Platform::Ios, "show clock", "x").is_none());
    }
}
