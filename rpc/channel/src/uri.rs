//! Target URI parsing: `scheme:[//authority/]path`.

use std::fmt;

/// A parsed target URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUri {
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: String,
}

/// Target parse error, surfaced at channel creation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot parse target: {0:?}")]
pub struct TargetParseError(pub String);

fn valid_scheme(scheme: &str) -> bool {
    let mut bytes = scheme.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.'))
}

impl TargetUri {
    /// Parse a target of the form `scheme:[//authority/]path`.
    ///
    /// A target with no recognizable scheme parses as scheme-less with
    /// everything in the path, letting the channel retry it against the
    /// default scheme.
    pub fn parse(target: &str) -> Result<Self, TargetParseError> {
        if target.is_empty() {
            return Err(TargetParseError(target.to_owned()));
        }

        let (scheme, rest) = match target.split_once(':') {
            Some((scheme, rest)) if valid_scheme(scheme) => (Some(scheme.to_owned()), rest),
            _ => (None, target),
        };

        if let Some(without_slashes) = rest.strip_prefix("//") {
            match without_slashes.split_once('/') {
                Some((authority, path)) => Ok(Self {
                    scheme,
                    authority: Some(authority.to_owned()),
                    path: path.to_owned(),
                }),
                None => Ok(Self {
                    scheme,
                    authority: Some(without_slashes.to_owned()),
                    path: String::new(),
                }),
            }
        } else {
            Ok(Self {
                scheme,
                authority: None,
                path: rest.to_owned(),
            })
        }
    }

    /// Re-interpret this target under the given scheme, used when the
    /// original scheme is unknown to the resolver registry.
    pub fn with_default_scheme(target: &str, scheme: &str) -> Result<Self, TargetParseError> {
        let mut uri = Self::parse(target)?;
        if uri.scheme.is_none() {
            uri.scheme = Some(scheme.to_owned());
        } else {
            // The whole original target becomes the path.
            uri = Self {
                scheme: Some(scheme.to_owned()),
                authority: None,
                path: target.to_owned(),
            };
        }
        Ok(uri)
    }
}

impl fmt::Display for TargetUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scheme) = &self.scheme {
            write!(f, "{}:", scheme)?;
        }
        if let Some(authority) = &self.authority {
            write!(f, "//{}/", authority)?;
        }
        write!(f, "{}", self.path)
    }
}
