//! Reply classification shared by the Telnet and serial links.
//!
//! Both links return free-form text, so the end of a reply is recognised by
//! shape. The patterns are tried in order and the first one found anywhere in
//! the buffered text wins; the reply ends where that match ends.

use regex::Regex;
use std::sync::LazyLock;

/// Shape of a recognised reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Bell-prefixed `ERRnnn` followed by CR.
    DeviceError,
    /// `$`-prefixed hex value, CR, ACK.
    Hex,
    /// Signed decimal value, optional trailing spaces, CR, ACK.
    Decimal,
    /// Status word, position, velocity and following error, CR-separated, ACK.
    StatusPvf,
    /// Anything ending in ACK.
    Acknowledged,
}

static DEVICE_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x07ERR\d{3}\r").expect("Invalid device error regex"));

static HEX_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$[A-Z0-9]+\r\x06").expect("Invalid hex reply regex"));

static DECIMAL_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-?(\d*\.)?\d+\s*\r\x06").expect("Invalid decimal reply regex")
});

static STATUS_PVF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z0-9]+\r-?(\d*\.)?\d+\r-?(\d*\.)?\d+\r-?(\d*\.)?\d+\r\x06")
        .expect("Invalid status reply regex")
});

static ACKNOWLEDGED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x06").expect("Invalid ACK regex"));

fn patterns() -> [(ResponseKind, &'static Regex); 5] {
    [
        (ResponseKind::DeviceError, &DEVICE_ERROR),
        (ResponseKind::Hex, &HEX_VALUE),
        (ResponseKind::Decimal, &DECIMAL_VALUE),
        (ResponseKind::StatusPvf, &STATUS_PVF),
        (ResponseKind::Acknowledged, &ACKNOWLEDGED),
    ]
}

/// Find the first reply shape present in `text`.
///
/// Returns the kind and the byte offset just past the match; text beyond that
/// offset belongs to whatever the controller sends next.
pub fn classify(text: &str) -> Option<(ResponseKind, usize)> {
    patterns()
        .into_iter()
        .find_map(|(kind, pattern)| pattern.find(text).map(|m| (kind, m.end())))
}
