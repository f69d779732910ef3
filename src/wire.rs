//! On-wire rendering helpers.
//!
//! Addresses serialize as lowercase `0x`-prefixed hex (see [`crate::address`]);
//! property offsets render as bare uppercase hex; the UE version travels
//! as the major integer only.

use serde::Serializer;

/// Serializes a property offset as prefixless uppercase hex, e.g. `0x1A0`
/// renders as `1A0`.
pub fn offset_hex<S: Serializer>(offset: &u32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&format_args!("{offset:X}"))
}
