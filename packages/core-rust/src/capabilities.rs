//! Capability tokens exchanged during session negotiation.
//!
//! The client advertises its capabilities in the `X-Morango-Capabilities`
//! request header; the server returns its own set in the `morangoinfo`
//! response. Only capabilities present on both sides take effect.

use std::collections::BTreeSet;

/// Server will co-sign and store client-generated certificate chains.
pub const ALLOW_CERTIFICATE_PUSHING: &str = "allow_certificate_pushing";
/// Buffer POST bodies may be gzip-compressed.
pub const GZIP_BUFFER_POST: &str = "gzip_buffer_post";
/// The remote drives stages asynchronously via transfer-session updates.
pub const ASYNC_OPERATIONS: &str = "async_operations";
/// Peer understands the nested per-partition FSIC layout.
pub const FSIC_V2_FORMAT: &str = "fsic_v2_format";

/// Header carrying the space-separated capability tokens.
pub const CAPABILITIES_HEADER: &str = "X-Morango-Capabilities";

/// An unordered set of capability tokens.
pub type Capabilities = BTreeSet<String>;

/// Parse the space-separated header value into a capability set.
#[must_use]
pub fn parse_capabilities(header_value: &str) -> Capabilities {
    header_value
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Render a capability set as the space-separated header value.
#[must_use]
pub fn render_capabilities(capabilities: &Capabilities) -> String {
    capabilities
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_render_roundtrip() {
        let set = parse_capabilities("gzip_buffer_post async_operations");
        assert!(set.contains(GZIP_BUFFER_POST));
        assert!(set.contains(ASYNC_OPERATIONS));
        assert_eq!(set.len(), 2);
        let rendered = render_capabilities(&set);
        assert_eq!(parse_capabilities(&rendered), set);
    }

    #[test]
    fn parse_tolerates_extra_whitespace() {
        let set = parse_capabilities("  fsic_v2_format   gzip_buffer_post ");
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn empty_header_is_empty_set() {
        assert!(parse_capabilities("").is_empty());
        assert_eq!(render_capabilities(&Capabilities::new()), "");
    }
}
