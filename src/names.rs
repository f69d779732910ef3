//! Chunked traversal of the target's name-interning pool.
//!
//! The pool is a list of blocks, each a contiguous slab of variable-length
//! entries. An entry id is composite: `(block << 16) | (byte_offset /
//! stride)`. Id 0 is `"None"` on every engine generation.

use std::collections::HashMap;

use tracing::warn;

use crate::address::Address;
use crate::error::Result;
use crate::events::{CancelToken, Event};
use crate::layout::LayoutProfile;
use crate::process::Process;

/// Offset of the `CurrentBlock` / `CurrentByteCursor` counters and the
/// block pointer array inside the pool header. Stable across generations.
const CURRENT_BLOCK_OFFSET: u64 = 0x08;
const CURRENT_CURSOR_OFFSET: u64 = 0x0C;
const BLOCKS_OFFSET: u64 = 0x10;

/// Entries per block is fixed at 2^16 stride units.
const BLOCK_OFFSET_BITS: u32 = 16;

/// An interned name id.
pub type NameId = u32;

/// The immutable id → string snapshot produced by the parser.
#[derive(Debug, Default)]
pub struct NameTable {
    names: HashMap<NameId, String>,
    skipped_blocks: u32,
}

impl NameTable {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Blocks abandoned because of a malformed entry header.
    pub fn skipped_blocks(&self) -> u32 {
        self.skipped_blocks
    }

    pub fn resolve(&self, id: NameId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    /// Resolution used by the model builders: missing ids read `"None"`.
    pub fn resolve_or_none(&self, id: NameId) -> &str {
        self.resolve(id).unwrap_or("None")
    }

    pub fn iter(&self) -> impl Iterator<Item = (NameId, &str)> {
        self.names.iter().map(|(&id, s)| (id, s.as_str()))
    }
}

/// Walks every block of the pool at `pool_base` and materializes the name
/// table. Emits one progress event per block; a malformed header abandons
/// the rest of that block only.
pub fn parse_name_pool(
    process: &Process,
    profile: &LayoutProfile,
    pool_base: Address,
    cancel: &CancelToken,
    mut progress: impl FnMut(Event),
) -> Result<NameTable> {
    let block_bytes = profile.name_block_stride << BLOCK_OFFSET_BITS;

    let current_block = process.read::<u32>(pool_base.add(CURRENT_BLOCK_OFFSET))?;
    let current_cursor = process.read::<u32>(pool_base.add(CURRENT_CURSOR_OFFSET))?;
    let total_chunks = current_block + 1;

    let mut table = NameTable::default();

    for block in 0..=current_block {
        cancel.checkpoint()?;

        let block_ptr =
            process.read_ptr(pool_base.add(BLOCKS_OFFSET + 8 * block as u64))?;
        let block_len = if block == current_block {
            current_cursor as u64
        } else {
            block_bytes
        };

        if !block_ptr.is_null() && block_len > 0 {
            let bytes = process.read_bytes(block_ptr, block_len as usize)?;
            walk_block(profile, block, &bytes, &mut table);
        }

        let current_names = table.len() as u32;
        progress(Event::FNamePoolProgress {
            current_chunk: block + 1,
            total_chunks,
            current_names,
            total_names: estimate_total(current_names, block + 1, total_chunks),
        });
    }

    Ok(table)
}

/// Projects the running count over the blocks not yet consumed. The last
/// block's event therefore reports `total_names == current_names`.
fn estimate_total(current_names: u32, consumed_blocks: u32, total_blocks: u32) -> u32 {
    let per_block = current_names / consumed_blocks.max(1);
    current_names + per_block * (total_blocks - consumed_blocks)
}

fn walk_block(profile: &LayoutProfile, block: u32, bytes: &[u8], table: &mut NameTable) {
    let stride = profile.name_block_stride as usize;
    let header_size = profile.name_entry_header_size as usize;
    let mut offset = 0usize;

    while offset + header_size <= bytes.len() {
        let header = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
        if !profile.name_header_encodes_length {
            break;
        }
        let len = (header >> 6) as usize;
        if len == 0 {
            // Zero padding after the last entry of the block.
            break;
        }
        let wide = header & 1 != 0;
        let payload = if wide { len * 2 } else { len };

        if offset + header_size + payload > bytes.len() {
            warn!(
                block,
                offset,
                len,
                "name entry runs past its block, abandoning the rest of the block"
            );
            table.skipped_blocks += 1;
            break;
        }

        let id = (block << BLOCK_OFFSET_BITS) | (offset / stride) as u32;
        let data = &bytes[offset + header_size..offset + header_size + payload];
        let string = if wide {
            let units: Vec<u16> = data
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        } else {
            String::from_utf8_lossy(data).into_owned()
        };
        table.names.insert(id, string);

        let advance = header_size + payload.div_ceil(stride) * stride;
        offset += advance;
    }
}
