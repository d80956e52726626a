//! Cache keys for rendered registry payloads.

use std::fmt;

/// Which slice of the registry a payload covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ViewScope {
    /// Every application.
    AllApplications,
    /// A single application by (uppercased) name.
    Application(String),
    /// Changes after a delta marker.
    Delta(u64),
}

/// Wire shape of instance entries in a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadFormat {
    /// All record fields plus lease metadata.
    Full,
    /// Routing essentials only: id, address, port, status.
    Compact,
}

impl PayloadFormat {
    /// Parse the `format` query parameter. Absent means full.
    pub fn parse(value: Option<&str>) -> Option<Self> {
        match value {
            None | Some("full") => Some(Self::Full),
            Some("compact") => Some(Self::Compact),
            Some(_) => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Compact => "compact",
        }
    }
}

/// Body encoding of a cached payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadEncoding {
    Identity,
    Gzip,
}

impl PayloadEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
        }
    }
}

/// Identity of one cached payload: what it covers, how instances are shaped,
/// and how the bytes are encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub scope: ViewScope,
    pub format: PayloadFormat,
    pub encoding: PayloadEncoding,
}

impl CacheKey {
    pub fn all(format: PayloadFormat, encoding: PayloadEncoding) -> Self {
        Self {
            scope: ViewScope::AllApplications,
            format,
            encoding,
        }
    }

    pub fn application(name: impl Into<String>, format: PayloadFormat, encoding: PayloadEncoding) -> Self {
        Self {
            scope: ViewScope::Application(name.into()),
            format,
            encoding,
        }
    }

    pub fn delta(since: u64, encoding: PayloadEncoding) -> Self {
        Self {
            scope: ViewScope::Delta(since),
            format: PayloadFormat::Full,
            encoding,
        }
    }

    pub fn is_delta(&self) -> bool {
        matches!(self.scope, ViewScope::Delta(_))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            ViewScope::AllApplications => write!(f, "all")?,
            ViewScope::Application(name) => write!(f, "app:{}", name)?,
            ViewScope::Delta(since) => write!(f, "delta:{}", since)?,
        }
        write!(f, "/{}/{}", self.format.as_str(), self.encoding.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing() {
        assert_eq!(PayloadFormat::parse(None), Some(PayloadFormat::Full));
        assert_eq!(PayloadFormat::parse(Some("full")), Some(PayloadFormat::Full));
        assert_eq!(
            PayloadFormat::parse(Some("compact")),
            Some(PayloadFormat::Compact)
        );
        assert_eq!(PayloadFormat::parse(Some("tiny")), None);
    }

    #[test]
    fn keys_distinguish_scope_format_and_encoding() {
        let a = CacheKey::all(PayloadFormat::Full, PayloadEncoding::Identity);
        let b = CacheKey::all(PayloadFormat::Full, PayloadEncoding::Gzip);
        let c = CacheKey::all(PayloadFormat::Compact, PayloadEncoding::Identity);
        let d = CacheKey::application("CHECKOUT", PayloadFormat::Full, PayloadEncoding::Identity);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn display_is_stable() {
        let key = CacheKey::delta(42, PayloadEncoding::Gzip);
        assert_eq!(key.to_string(), "delta:42/full/gzip");
    }
}
