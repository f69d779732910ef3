//! Chunked traversal of the target's global object registry.
//!
//! The registry is a chunked pointer table: a header pointing at an array
//! of chunk pointers, each chunk a fixed-size array of items, each item
//! holding the address of one reflected object. Ids equal the target's
//! own `InternalIndex`, so they are stable within one attach.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use serde::Serialize;
use tracing::{debug, warn};

use crate::address::Address;
use crate::error::{Error, Result};
use crate::events::{CancelToken, Event};
use crate::layout::LayoutProfile;
use crate::names::{NameId, NameTable};
use crate::process::Process;

/// The registry header, as it sits in target memory.
#[derive(Debug, Copy, Clone, Zeroable, Pod)]
#[repr(C)]
struct ChunkedArrayHeader {
    objects: u64,
    preallocated: u64,
    max_elements: i32,
    num_elements: i32,
    max_chunks: i32,
    num_chunks: i32,
}

/// One reflected object, raw fields straight from the target plus the
/// derived fields filled by the enrichment pass.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectRecord {
    pub id: u32,
    pub address: Address,
    pub class_ptr: Address,
    pub outer_ptr: Address,
    pub name_id: NameId,
    pub flags: u32,
    pub name: String,
    pub type_name: String,
    pub full_name: String,
    pub package: String,
}

/// The immutable object snapshot: records indexed by id, plus the
/// address → id index the resolution layer leans on.
#[derive(Debug, Default)]
pub struct ObjectTable {
    records: Vec<Option<ObjectRecord>>,
    by_address: HashMap<u64, u32>,
    empty_slots: u32,
    unresolved_slots: u32,
}

impl ObjectTable {
    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// Null or destroyed slots seen during the walk.
    pub fn empty_slots(&self) -> u32 {
        self.empty_slots
    }

    /// Slots whose object failed cross-validation.
    pub fn unresolved_slots(&self) -> u32 {
        self.unresolved_slots
    }

    pub fn get(&self, id: u32) -> Option<&ObjectRecord> {
        self.records.get(id as usize).and_then(Option::as_ref)
    }

    pub fn id_of(&self, address: Address) -> Option<u32> {
        self.by_address.get(&address.value()).copied()
    }

    pub fn by_address(&self, address: Address) -> Option<&ObjectRecord> {
        self.id_of(address).and_then(|id| self.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectRecord> {
        self.records.iter().filter_map(Option::as_ref)
    }
}

/// A package grouping, ready for by-package browsing.
#[derive(Debug, Clone, Serialize)]
pub struct Package {
    pub name: String,
    pub object_ids: Vec<u32>,
}

/// Packages sorted ascending by name. Built once per attach.
#[derive(Debug, Default)]
pub struct PackageIndex {
    packages: Vec<Package>,
}

impl PackageIndex {
    pub fn build(table: &ObjectTable) -> Self {
        let mut grouped: HashMap<&str, Vec<u32>> = HashMap::new();
        for record in table.iter() {
            grouped.entry(record.package.as_str()).or_default().push(record.id);
        }
        let mut packages: Vec<Package> = grouped
            .into_iter()
            .map(|(name, object_ids)| Package {
                name: name.to_owned(),
                object_ids,
            })
            .collect();
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        Self { packages }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Package> {
        self.packages.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Package> {
        self.packages.iter().find(|p| p.name == name)
    }
}

/// Walks every chunk of the registry at `array_base`, cross-validating
/// each object, then runs the enrichment pass. One progress event per
/// chunk.
pub fn parse_guobject_array(
    process: &Process,
    profile: &LayoutProfile,
    array_base: Address,
    names: &NameTable,
    cancel: &CancelToken,
    mut progress: impl FnMut(Event),
) -> Result<ObjectTable> {
    let header = process.read::<ChunkedArrayHeader>(array_base)?;
    if header.max_chunks <= 0 || header.num_chunks < 0 || header.num_chunks > header.max_chunks {
        return Err(Error::CorruptLayout {
            location: "GUObjectArray header",
        });
    }
    let per_chunk = (header.max_elements / header.max_chunks) as u64;
    if per_chunk == 0 {
        return Err(Error::CorruptLayout {
            location: "GUObjectArray chunk capacity",
        });
    }

    let total_chunks = header.num_chunks as u32;
    let total_objects = header.num_elements.max(0) as u32;
    let item_size = profile.uobject_item_size;
    let header_len = (profile.uobject_outer_offset + 8) as usize;

    let mut table = ObjectTable::default();

    for chunk in 0..total_chunks {
        cancel.checkpoint()?;

        let first_slot = chunk as u64 * per_chunk;
        let slots_here = per_chunk.min((total_objects as u64).saturating_sub(first_slot));
        let chunk_ptr =
            process.read_ptr(Address::new(header.objects).add(8 * chunk as u64))?;

        if chunk_ptr.is_null() {
            for _ in 0..slots_here {
                table.records.push(None);
                table.empty_slots += 1;
            }
        } else {
            let bytes = process.read_bytes(chunk_ptr, (slots_here * item_size) as usize)?;
            for slot in 0..slots_here {
                let index = (first_slot + slot) as u32;
                let item = &bytes[(slot * item_size) as usize..][..item_size as usize];
                let object = Address::new(read_u64(
                    item,
                    profile.uobject_item_object_offset as usize,
                ));
                if object.is_null() {
                    table.records.push(None);
                    table.empty_slots += 1;
                    continue;
                }
                match read_object_header(process, profile, object, header_len, index) {
                    Some(record) => {
                        table.by_address.insert(object.value(), index);
                        table.records.push(Some(record));
                    }
                    None => {
                        debug!(index, %object, "object failed cross-validation");
                        table.records.push(None);
                        table.unresolved_slots += 1;
                    }
                }
            }
        }

        progress(Event::GuObjectArrayProgress {
            current_chunk: chunk + 1,
            total_chunks,
            current_objects: (first_slot + slots_here) as u32,
            total_objects,
        });
    }

    if table.unresolved_slots > 0 {
        warn!(
            unresolved = table.unresolved_slots,
            "some object slots failed validation and were skipped"
        );
    }

    enrich(&mut table, names);
    Ok(table)
}

fn read_object_header(
    process: &Process,
    profile: &LayoutProfile,
    object: Address,
    header_len: usize,
    expected_index: u32,
) -> Option<ObjectRecord> {
    let bytes = process.read_bytes(object, header_len).ok()?;
    let flags = read_u32(&bytes, profile.uobject_flags_offset as usize);
    let internal_index = read_u32(&bytes, profile.uobject_index_offset as usize);
    let class_ptr = Address::new(read_u64(&bytes, profile.uobject_class_offset as usize));
    let name_id = read_u32(&bytes, profile.uobject_name_offset as usize);
    let outer_ptr = Address::new(read_u64(&bytes, profile.uobject_outer_offset as usize));

    if internal_index != expected_index {
        return None;
    }
    if !class_ptr.is_null() && !process.is_pointer(class_ptr) {
        return None;
    }
    if !outer_ptr.is_null() && !process.is_pointer(outer_ptr) {
        return None;
    }

    Some(ObjectRecord {
        id: expected_index,
        address: object,
        class_ptr,
        outer_ptr,
        name_id,
        flags,
        name: String::new(),
        type_name: String::new(),
        full_name: String::new(),
        package: String::new(),
    })
}

/// The second pass: resolve names, walk outer chains for the dotted full
/// name, and record the package (root outer) of every object.
fn enrich(table: &mut ObjectTable, names: &NameTable) {
    let limit = table.records.len().max(1);
    let mut derived: Vec<(u32, String, String, String)> = Vec::new();

    for record in table.iter() {
        let type_name = match table.by_address(record.class_ptr) {
            Some(class) => names.resolve_or_none(class.name_id).to_owned(),
            None => "None".to_owned(),
        };

        // Leaf to root, then reverse and join with dots.
        let mut chain = vec![names.resolve_or_none(record.name_id).to_owned()];
        let mut cursor = record.outer_ptr;
        let mut steps = 0;
        while let Some(outer) = table.by_address(cursor) {
            chain.push(names.resolve_or_none(outer.name_id).to_owned());
            cursor = outer.outer_ptr;
            steps += 1;
            if steps > limit {
                break;
            }
        }
        let package = chain.last().cloned().unwrap_or_default();
        chain.reverse();
        derived.push((record.id, type_name, chain.join("."), package));
    }

    for (id, type_name, full_name, package) in derived {
        if let Some(record) = table.records[id as usize].as_mut() {
            record.name = names.resolve_or_none(record.name_id).to_owned();
            record.type_name = type_name;
            record.full_name = full_name;
            record.package = package;
        }
    }
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}
