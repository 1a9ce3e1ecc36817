//! Controller identity codes (the reply to `cid`) and the names they map to.

use crate::error::{PmacError, PmacResult};

/// Which command dialect a controller speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerFamily {
    /// Turbo PMAC, Geobrick and Clipper (Ethernet, Telnet and serial links).
    Turbo,
    /// Power PMAC (gpascii over SSH).
    PowerPmac,
}

struct ModelEntry {
    code: u32,
    name: &'static str,
    short_name: &'static str,
}

const TURBO_MODELS: &[ModelEntry] = &[
    ModelEntry {
        code: 602413,
        name: "Turbo PMAC2-VME",
        short_name: "PMAC2 VME",
    },
    ModelEntry {
        code: 602404,
        name: "Turbo PMAC2-PC",
        short_name: "PMAC2 PC",
    },
    ModelEntry {
        code: 603382,
        name: "Geo Brick (3U Turbo PMAC2)",
        short_name: "Geobrick",
    },
    ModelEntry {
        code: 603437,
        name: "Turbo Clipper",
        short_name: "Clipper",
    },
];

const POWER_PMAC_MODELS: &[ModelEntry] = &[
    ModelEntry {
        code: 604020,
        name: "Power PMAC UMAC",
        short_name: "PPMAC UMAC",
    },
    ModelEntry {
        code: 604002,
        name: "Power Brick",
        short_name: "Power Brick",
    },
];

/// Codes of the Geobrick/Clipper family (8 on-board axes plus MACRO ring).
const GEOBRICK_FAMILY: &[u32] = &[603382, 603437];

fn table(family: ControllerFamily) -> &'static [ModelEntry] {
    match family {
        ControllerFamily::Turbo => TURBO_MODELS,
        ControllerFamily::PowerPmac => POWER_PMAC_MODELS,
    }
}

/// Long model name for a code; unknown codes are unsupported.
pub fn model_name(family: ControllerFamily, code: u32) -> PmacResult<&'static str> {
    table(family)
        .iter()
        .find(|entry| entry.code == code)
        .map(|entry| entry.name)
        .ok_or(PmacError::UnsupportedModel(code))
}

/// Short model name for a code, falling back to a generic name.
pub fn short_model_name(family: ControllerFamily, code: u32) -> &'static str {
    table(family)
        .iter()
        .find(|entry| entry.code == code)
        .map(|entry| entry.short_name)
        .unwrap_or(match family {
            ControllerFamily::Turbo => "Unknown",
            ControllerFamily::PowerPmac => "PPMAC",
        })
}

/// `true` for Geobrick and Clipper controllers.
pub fn is_geobrick(code: u32) -> bool {
    GEOBRICK_FAMILY.contains(&code)
}

/// Parse a `cid` reply.
///
/// Turbo links answer `<digits>\r\x06`; gpascii answers with the bare number.
pub fn parse_model_code(family: ControllerFamily, reply: &str) -> PmacResult<u32> {
    let digits = match family {
        ControllerFamily::Turbo => reply.strip_suffix("\r\x06"),
        ControllerFamily::PowerPmac => Some(reply.trim()),
    };
    digits
        .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|d| d.parse().ok())
        .ok_or_else(|| PmacError::MalformedResponse(reply.to_string()))
}

/// Model fields cached per connection, invalidated only by an explicit reset.
#[derive(Debug, Default, Clone)]
pub struct ModelCache {
    /// Identity code from `cid`.
    pub code: Option<u32>,
    /// Long model name.
    pub name: Option<&'static str>,
    /// Short model name.
    pub short_name: Option<&'static str>,
    /// Total axis count.
    pub num_axes: Option<u32>,
}

impl ModelCache {
    /// Forget everything learned from the controller.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
