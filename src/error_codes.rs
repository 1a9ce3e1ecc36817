//! Descriptions of the `ERRnnn` codes a Turbo PMAC reports.
//!
//! Used for diagnostics only. Responses carrying an error code are still
//! successful exchanges as far as the transport is concerned.

use regex::Regex;
use std::sync::LazyLock;

static ERROR_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ERR\d{3}").expect("Invalid error code regex"));

const PMAC_ERRORS: [(&str, &str); 19] = [
    ("ERR001", "Command not allowed during program execution"),
    ("ERR002", "Password error"),
    ("ERR003", "Data error or unrecognized command"),
    ("ERR004", "Illegal character: bad value (>127 ASCII) or serial parity/framing error"),
    ("ERR005", "Command not allowed unless buffer is open"),
    ("ERR006", "No room in buffer for command"),
    ("ERR007", "Buffer already in use"),
    ("ERR008", "MACRO auxiliary communications error"),
    ("ERR009", "Program structural error (e.g. ENDIF without IF)"),
    ("ERR010", "Both overtravel limits set for a motor in the C.S."),
    ("ERR011", "Previous move not completed"),
    ("ERR012", "A motor in the coordinate system is open-loop"),
    ("ERR013", "A motor in the coordinate system is not activated"),
    ("ERR014", "No motors in the coordinate system"),
    ("ERR015", "Not pointing to valid program buffer"),
    ("ERR016", "Running improperly structured program (e.g. missing ENDWHILE)"),
    ("ERR017", "Trying to resume after H or Q with motors out of stopped position"),
    (
        "ERR018",
        "Attempt to perform phase reference during move, move during phase reference, or enabling with phase clock error",
    ),
    ("ERR019", "Illegal position-change command while moves stored in CCUBUF"),
];

/// Human-readable description for an error code such as `"ERR003"`.
pub fn describe(code: &str) -> Option<&'static str> {
    PMAC_ERRORS
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, text)| *text)
}

/// First `ERRnnn` code embedded in a response, if any.
pub fn find_error_code(response: &str) -> Option<&str> {
    ERROR_CODE.find(response).map(|m| m.as_str())
}
