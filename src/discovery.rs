//! Locating the target's registries: NamePool, GUObjectArray and GWorld.
//!
//! Each locator runs the same kernel: curated signatures over the
//! executable sections, RIP-relative resolution, a structural fingerprint
//! check on the candidate, and a strided fallback sweep of the data
//! sections when every signature misses.

use std::ops::RangeInclusive;

use tracing::{debug, trace};

use crate::address::Address;
use crate::error::{Error, Result};
use crate::layout::LayoutProfile;
use crate::names::NameTable;
use crate::pe::PeImage;
use crate::process::Process;
use crate::signature::{resolve_rip, Signature};

/// NamePool block pointer array offset inside the pool header.
const POOL_BLOCKS_OFFSET: u64 = 0x10;

/// `NumChunks` offset inside the registry header.
const ARRAY_NUM_CHUNKS_OFFSET: u64 = 0x1C;

static NAME_POOL_SIGS: &[(Signature<13>, u64)] = &[
    (Signature::new("74 09 48 8D 15 ?? ?? ?? ?? EB 16 ?? ??"), 5),
    (Signature::new("89 5C 24 ?? 89 44 24 ?? 74 ?? 48 8D 15"), 13),
    (Signature::new("57 0F B7 F8 74 ?? B8 ?? ?? ?? ?? 8B 44"), 7),
];

static GUOBJECT_ARRAY_SIGS: &[(Signature<15>, u64)] = &[
    (Signature::new("48 8B 05 ?? ?? ?? ?? 48 8B 0C C8 48 8D 04 D1"), 3),
    (Signature::new("48 8D 0D ?? ?? ?? ?? C6 05 ?? ?? ?? ?? 01 E8"), 3),
    (Signature::new("48 8B 0D ?? ?? ?? ?? 81 4C D1 08 00 00 00 40"), 3),
];

static GWORLD_SIGS: &[(Signature<22>, u64)] = &[
    (
        Signature::new("80 7C 24 ?? 00 ?? ?? 48 8B 3D ?? ?? ?? ?? 48 ?? ?? ?? ?? ?? ?? ??"),
        10,
    ),
    (
        Signature::new("48 8B 05 ?? ?? ?? ?? 48 3B ?? 48 0F 44 ?? 48 89 05 ?? ?? ?? ?? E8"),
        3,
    ),
];

/// The probe a fallback sweep evaluates at every strided position. The
/// string variant resolves the scanned 32-bit value as a name id through
/// the caller's resolver.
pub enum ScanProbe<'a> {
    U32Eq(u32),
    U32Range(RangeInclusive<u32>),
    U64Eq(u64),
    NameSentinel {
        expect: &'a str,
        /// Full string equality when set; substring containment otherwise.
        full_compare: bool,
    },
}

/// A bounded window around a pivot address, swept at a fixed stride.
#[derive(Debug, Clone, Copy)]
pub struct ScanWindow {
    pub pivot: Address,
    pub before: u64,
    pub after: u64,
    pub stride: u64,
}

/// Sweeps the window and returns every position whose probed value
/// matches, capped at `limit`.
pub fn check_value_scan(
    process: &Process,
    window: ScanWindow,
    probe: &ScanProbe<'_>,
    resolve: &dyn Fn(u32) -> Option<String>,
    limit: usize,
) -> Vec<Address> {
    let start = window.pivot.value().saturating_sub(window.before);
    let end = window.pivot.value().saturating_add(window.after);
    let mut hits = Vec::new();
    let mut cursor = start;
    while cursor < end && hits.len() < limit {
        let at = Address::new(cursor);
        let matched = match probe {
            ScanProbe::U32Eq(expect) => process.read::<u32>(at).is_ok_and(|v| v == *expect),
            ScanProbe::U32Range(range) => {
                process.read::<u32>(at).is_ok_and(|v| range.contains(&v))
            }
            ScanProbe::U64Eq(expect) => process.read::<u64>(at).is_ok_and(|v| v == *expect),
            ScanProbe::NameSentinel {
                expect,
                full_compare,
            } => process.read::<u32>(at).is_ok_and(|id| {
                resolve(id).is_some_and(|name| {
                    if *full_compare {
                        name == *expect
                    } else {
                        name.contains(expect)
                    }
                })
            }),
        };
        if matched {
            hits.push(at);
        }
        cursor += window.stride;
    }
    hits
}

/// The three registry locators, bound to one attach.
pub struct Discovery<'a> {
    pub process: &'a Process,
    pub image: &'a PeImage,
    pub profile: &'static LayoutProfile,
}

impl Discovery<'_> {
    /// Locates the name-interning pool.
    pub fn locate_name_pool(&self) -> Result<Address> {
        if let Some(found) =
            self.locate_by_signatures(NAME_POOL_SIGS, |addr| self.validate_name_pool(addr))
        {
            return Ok(found);
        }
        debug!("every NamePool signature missed, sweeping data sections");
        self.sweep_data_sections(8, |addr| self.validate_name_pool(addr))
            .ok_or(Error::NotFound {
                what: "NamePool",
                key: "no signature or sweep hit".to_owned(),
            })
    }

    /// Locates the global object registry. When the pool base is already
    /// known it pivots the fallback sweep around it, probing for a
    /// plausible chunk count next door.
    pub fn locate_guobject_array(&self, name_pool: Option<Address>) -> Result<Address> {
        if let Some(found) =
            self.locate_by_signatures(GUOBJECT_ARRAY_SIGS, |addr| self.validate_guobject_array(addr))
        {
            return Ok(found);
        }
        debug!("every GUObjectArray signature missed, running proximity scan");

        if let Some(pool) = name_pool {
            let window = ScanWindow {
                pivot: pool,
                before: 0x10_0000,
                after: 0x10_0000,
                stride: 4,
            };
            let hits = check_value_scan(
                self.process,
                window,
                &ScanProbe::U32Range(1..=4096),
                &|_| None,
                4096,
            );
            for hit in hits {
                let candidate = hit.add_signed(-(ARRAY_NUM_CHUNKS_OFFSET as i64));
                if self.validate_guobject_array(candidate) {
                    return Ok(candidate);
                }
            }
        }
        self.sweep_data_sections(8, |addr| self.validate_guobject_array(addr))
            .ok_or(Error::NotFound {
                what: "GUObjectArray",
                key: "no signature or sweep hit".to_owned(),
            })
    }

    /// Locates the GWorld global. With a parsed name table the candidate
    /// must point at an object whose class resolves to `World`.
    pub fn locate_gworld(&self, names: Option<&NameTable>) -> Result<Address> {
        if let Some(found) =
            self.locate_by_signatures(GWORLD_SIGS, |addr| self.validate_gworld(addr, names))
        {
            return Ok(found);
        }
        debug!("every GWorld signature missed, sweeping data sections");
        self.sweep_data_sections(8, |addr| self.validate_gworld(addr, names))
            .ok_or(Error::NotFound {
                what: "GWorld",
                key: "no signature or sweep hit".to_owned(),
            })
    }

    fn locate_by_signatures<const N: usize>(
        &self,
        signatures: &[(Signature<N>, u64)],
        validate: impl Fn(Address) -> bool,
    ) -> Option<Address> {
        for (index, (signature, rip_offset)) in signatures.iter().enumerate() {
            for section in self.image.executable_sections() {
                let Some(hit) = signature.scan_process_range(self.process, section.base, section.size)
                else {
                    continue;
                };
                let Ok(candidate) = resolve_rip(self.process, hit.add(*rip_offset)) else {
                    continue;
                };
                trace!(signature = index, %hit, %candidate, "signature matched");
                if validate(candidate) {
                    return Some(candidate);
                }
                debug!(signature = index, %candidate, "candidate failed validation");
            }
        }
        None
    }

    /// The last-ditch sweep: every aligned slot of every non-executable
    /// section, first validated candidate wins.
    fn sweep_data_sections(&self, stride: u64, validate: impl Fn(Address) -> bool) -> Option<Address> {
        for section in self.image.sections.iter().filter(|s| !s.executable) {
            let mut cursor = section.base.value();
            let end = cursor + section.size;
            while cursor + stride <= end {
                let candidate = Address::new(cursor);
                if validate(candidate) {
                    return Some(candidate);
                }
                cursor += stride;
            }
        }
        None
    }

    /// NamePool fingerprint: the first block exists and its first entry
    /// decodes to printable ASCII of sane length.
    fn validate_name_pool(&self, addr: Address) -> bool {
        let Ok(block0) = self.process.read_ptr(addr.add(POOL_BLOCKS_OFFSET)) else {
            return false;
        };
        if !self.process.is_pointer(block0) {
            return false;
        }
        let Ok(header) = self.process.read::<u16>(block0) else {
            return false;
        };
        let len = (header >> 6) as usize;
        if len == 0 || len > 1023 || header & 1 != 0 {
            return false;
        }
        let Ok(bytes) = self
            .process
            .read_bytes(block0.add(self.profile.name_entry_header_size), len)
        else {
            return false;
        };
        bytes.iter().all(|&b| (0x20..0x7F).contains(&b))
    }

    /// Registry fingerprint: a sane chunked header, a real first chunk,
    /// and a first object that points back at slot zero with a valid
    /// class.
    fn validate_guobject_array(&self, addr: Address) -> bool {
        let Ok(header) = self.process.read::<[i32; 4]>(addr.add(0x10)) else {
            return false;
        };
        let [max_elements, num_elements, max_chunks, num_chunks] = header;
        if max_chunks <= 0
            || max_chunks > 0x10000
            || num_chunks <= 0
            || num_chunks > max_chunks
            || max_elements <= 0
            || num_elements < 0
            || num_elements > max_elements
            || max_elements / max_chunks == 0
        {
            return false;
        }
        let Ok(chunks) = self.process.read_ptr(addr) else {
            return false;
        };
        if !self.process.is_pointer(chunks) {
            return false;
        }
        let Ok(chunk0) = self.process.read_ptr(chunks) else {
            return false;
        };
        if !self.process.is_pointer(chunk0) {
            return false;
        }
        let Ok(object0) = self
            .process
            .read_ptr(chunk0.add(self.profile.uobject_item_object_offset))
        else {
            return false;
        };
        if !self.process.is_pointer(object0) {
            return false;
        }
        let index_ok = self
            .process
            .read::<u32>(object0.add(self.profile.uobject_index_offset))
            .is_ok_and(|index| index == 0);
        let class_ok = self
            .process
            .read_ptr(object0.add(self.profile.uobject_class_offset))
            .is_ok_and(|class| self.process.is_pointer(class));
        index_ok && class_ok
    }

    /// GWorld fingerprint: a pointer slot whose target's class pointer is
    /// valid, and resolves to `World` once names are parsed.
    fn validate_gworld(&self, addr: Address, names: Option<&NameTable>) -> bool {
        let Ok(world) = self.process.read_ptr(addr) else {
            return false;
        };
        if !self.process.is_pointer(world) {
            return false;
        }
        let Ok(class) = self
            .process
            .read_ptr(world.add(self.profile.uobject_class_offset))
        else {
            return false;
        };
        if !self.process.is_pointer(class) {
            return false;
        }
        match names {
            Some(names) => self
                .process
                .read::<u32>(class.add(self.profile.uobject_name_offset))
                .is_ok_and(|id| names.resolve(id) == Some("World")),
            None => true,
        }
    }
}
