use std::str::FromStr;

use crate::error::EngineError;

/// Minimum engine version this adapter is tested against.
pub const MIN_ENGINE_VERSION: EngineVersion = EngineVersion { major: 0, minor: 18, patch: 0 };

/// Engine semantic version, ordered field-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FromStr for EngineVersion {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept trailing pre-release/build noise, e.g. "0.18.0-rc1".
        let core: String = s
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let mut parts = core.split('.');
        let parse = |part: Option<&str>| -> Option<u32> { part?.parse().ok() };
        match (parse(parts.next()), parse(parts.next()), parse(parts.next())) {
            (Some(major), Some(minor), patch) => Ok(EngineVersion {
                major,
                minor,
                patch: patch.unwrap_or(0),
            }),
            _ => Err(EngineError::VersionUnparsable(s.to_string())),
        }
    }
}

impl std::fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Extract the engine version from `version` output: the JSON form first
/// (`{"version": "0.18.0", ...}`), then the plain-text form
/// (`restic 0.18.0 compiled with go1.21 ...`).
pub fn parse_version_output(stdout: &str) -> Result<EngineVersion, EngineError> {
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            if let Some(version) = value.get("version").and_then(|v| v.as_str()) {
                return version.parse();
            }
        }
        // Plain text: version is the first token that parses.
        for token in line.split_whitespace() {
            if token.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                if let Ok(version) = token.parse() {
                    return Ok(version);
                }
            }
        }
    }
    Err(EngineError::VersionUnparsable(stdout.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_orders_versions() {
        let v: EngineVersion = "0.18.0".parse().unwrap();
        assert_eq!(v, EngineVersion { major: 0, minor: 18, patch: 0 });
        assert!(v >= MIN_ENGINE_VERSION);

        let old: EngineVersion = "0.17.3".parse().unwrap();
        assert!(old < MIN_ENGINE_VERSION);

        let newer: EngineVersion = "0.18.1-rc1".parse().unwrap();
        assert!(newer > v);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<EngineVersion>().is_err());
        assert!("abc".parse::<EngineVersion>().is_err());
    }

    #[test]
    fn parses_json_version_output() {
        let out = r#"{"message_type":"version","version":"0.18.0","go_version":"go1.22"}"#;
        assert_eq!(parse_version_output(out).unwrap().to_string(), "0.18.0");
    }

    #[test]
    fn parses_plain_text_version_output() {
        let out = "restic 0.18.2 compiled with go1.22.1 on linux/amd64";
        assert_eq!(parse_version_output(out).unwrap().to_string(), "0.18.2");
    }

    #[test]
    fn unparsable_version_output_is_an_error() {
        assert!(matches!(
            parse_version_output("no version here"),
            Err(EngineError::VersionUnparsable(_))
        ));
    }
}
