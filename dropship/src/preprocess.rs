//! Pure textual preprocessing of the raw deployment configuration.
//!
//! Kept free of I/O and collaborators so it can be unit-tested directly.

use crate::config::HostParameters;
use crate::errors::DeployError;

/// Substitutes `{Stamp}`, `{Machine}`, `{Ring}`, `{Environment}`,
/// `{ConfigurationId}` and every caller-supplied property into `raw`.
/// Substitution is purely textual; properties are applied in sorted key order
/// so the output is deterministic. Any `{Identifier}` token left afterwards
/// is an error.
pub fn preprocess(raw: &str, parameters: &HostParameters) -> Result<String, DeployError> {
    let mut substitutions: Vec<(String, &str)> = vec![
        ("{Stamp}".to_string(), parameters.stamp.as_str()),
        ("{Machine}".to_string(), parameters.machine.as_str()),
        ("{Ring}".to_string(), parameters.ring.as_str()),
        ("{Environment}".to_string(), parameters.environment.as_str()),
        (
            "{ConfigurationId}".to_string(),
            parameters.configuration_id.as_str(),
        ),
    ];

    let mut properties: Vec<_> = parameters.properties.iter().collect();
    properties.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in properties {
        substitutions.push((format!("{{{key}}}"), value.as_str()));
    }

    let mut text = raw.to_string();
    for (token, value) in &substitutions {
        text = text.replace(token.as_str(), value);
    }

    if let Some(token) = unresolved_token(&text) {
        return Err(DeployError::Malformed(format!(
            "unresolved preprocessor token {{{token}}}"
        )));
    }
    Ok(text)
}

/// Finds a leftover `{Identifier}` marker. JSON object braces never qualify:
/// an identifier is one or more ASCII alphanumerics or underscores directly
/// enclosed by braces.
fn unresolved_token(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut start = None;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'{' => start = Some(i + 1),
            b'}' => {
                if let Some(s) = start
                    && s < i
                {
                    return Some(&text[s..i]);
                }
                start = None;
            }
            c if c.is_ascii_alphanumeric() || c == b'_' => {}
            _ => start = None,
        }
    }
    None
}
