use timelocker_domain::uri_scheme;

use crate::error::RepoError;

/// A repository URI split into scheme and remainder, with engine-style
/// normalisation applied (`s3://host/bucket` → `s3:host/bucket`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUri {
    /// Normalised form, suitable for hashing into the repository id.
    pub raw: String,
    /// Lower-cased scheme; empty for a bare filesystem path.
    pub scheme: String,
    /// Everything after `scheme:`, with the `//` of `file://` stripped.
    pub rest: String,
}

impl ParsedUri {
    /// The location string handed to the engine's `-r` flag. Local
    /// repositories pass a plain path; everything else passes the
    /// normalised URI.
    pub fn engine_location(&self) -> &str {
        match self.scheme.as_str() {
            "" | "file" | "local" => &self.rest,
            _ => &self.raw,
        }
    }
}

/// Parse and normalise a repository URI. Bare paths are accepted here and
/// mapped to the local backend; user-facing layers reject them earlier via
/// [`ensure_explicit_scheme`].
pub fn parse_repository_uri(uri: &str) -> Result<ParsedUri, RepoError> {
    let trimmed = uri.trim();
    if trimmed.is_empty() {
        return Err(RepoError::InvalidUri { uri: uri.to_string(), reason: "empty uri".into() });
    }

    let raw = normalise(trimmed);
    let scheme = uri_scheme(&raw).to_lowercase();

    let rest = if scheme.is_empty() {
        raw.clone()
    } else {
        let after = &raw[scheme.len() + 1..];
        match scheme.as_str() {
            // file:///path and file://path both mean a path.
            "file" | "local" => after.trim_start_matches("//").to_string(),
            _ => after.to_string(),
        }
    };

    if matches!(scheme.as_str(), "" | "file" | "local") && rest.is_empty() {
        return Err(RepoError::InvalidUri {
            uri: uri.to_string(),
            reason: "local repository uri has no path".into(),
        });
    }

    Ok(ParsedUri { raw, scheme, rest })
}

/// Reject a bare path with a remediation hint naming `file://`. Applies to
/// any location a user supplies directly.
pub fn ensure_explicit_scheme(uri: &str) -> Result<(), RepoError> {
    if uri_scheme(uri.trim()).is_empty() {
        return Err(RepoError::BarePath { uri: uri.trim().to_string() });
    }
    Ok(())
}

/// The engine's canonical single-colon form for s3.
fn normalise(uri: &str) -> String {
    match uri.strip_prefix("s3://") {
        Some(rest) => format!("s3:{}", rest),
        None => uri.to_string(),
    }
}
