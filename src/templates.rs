//! Built-in platform templates.
//!
//! Each [`Platform`] maps to a prompt spec (prompts, pager, error lines,
//! interactive inputs) and the session preamble run once after login.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::device::Platform;
use crate::error::ConnectError;
use crate::prompt::{InputResponse, InputRule, PromptHandler, PromptLevel, PromptSpec};

/// Metadata for a built-in platform template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TemplateMetadata {
    pub platform: Platform,
    pub vendor: String,
    pub family: String,
    pub template_version: String,
}

pub fn template_metadata(platform: Platform) -> TemplateMetadata {
    let family = match platform {
        Platform::Ios => "IOS",
        Platform::IosXe => "IOS-XE",
        Platform::IosXr => "IOS-XR",
    };
    TemplateMetadata {
        platform,
        vendor: "Cisco".to_string(),
        family: family.to_string(),
        template_version: "1.0.0".to_string(),
    }
}

/// Commands run once per new session, before any catalog command.
pub fn preamble(platform: Platform) -> &'static [&'static str] {
    match platform {
        Platform::Ios | Platform::IosXe => &["terminal length 0", "terminal width 0"],
        Platform::IosXr => &["terminal length 0", "terminal width 0", "terminal exec prompt no-timestamp"],
    }
}

/// Command that raises a user-mode login to privileged mode.
pub fn enable_command(platform: Platform) -> Option<&'static str> {
    match platform {
        Platform::Ios | Platform::IosXe => Some("enable"),
        // XR task groups grant privileges at login.
        Platform::IosXr => None,
    }
}

fn cisco_errors() -> Vec<String> {
    [
        r"^\s*% Invalid input detected.*",
        r"^\s*% Incomplete command.*",
        r"^\s*% Ambiguous command.*",
        r"^\s*% Unknown command.*",
        r"^\s*% Bad IP address or host name.*",
        r"^Command authorization failed.*",
        r"^Command rejected:.*",
        r"^\s*%.+",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn enable_password_input() -> InputRule {
    InputRule {
        pattern: r"^\x00*\r?(Enable )?[Pp]assword:\s*$".to_string(),
        response: InputResponse::EnableSecret,
        record: false,
    }
}

/// Prompt spec for a platform.
pub fn prompt_spec(platform: Platform) -> PromptSpec {
    match platform {
        Platform::Ios | Platform::IosXe => PromptSpec {
            prompts: vec![
                (PromptLevel::Privileged, r"^[\w.\-@/:]+#\s*$".to_string()),
                (PromptLevel::User, r"^[\w.\-@/:]+>\s*$".to_string()),
            ],
            more: vec![r"^\s*--More--\s*$".to_string(), r"^\s*<--- More --->\s*$".to_string()],
            errors: cisco_errors(),
            ignore_errors: vec![r"^\s*%\s*Type .* for more".to_string()],
            inputs: vec![enable_password_input()],
        },
        Platform::IosXr => PromptSpec {
            // RP/0/RSP0/CPU0:pe1#
            prompts: vec![(
                PromptLevel::Privileged,
                r"^(RP/\d+/\S+:)?[\w.\-@]+#\s*$".to_string(),
            )],
            more: vec![r"^\s*--More--\s*$".to_string()],
            errors: cisco_errors(),
            ignore_errors: Vec::new(),
            inputs: Vec::new(),
        },
    }
}

/// Compiled prompt handler for a platform.
pub fn by_platform(platform: Platform) -> Result<PromptHandler, ConnectError> {
    PromptHandler::new(&prompt_spec(platform))
}
