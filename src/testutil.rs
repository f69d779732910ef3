//! In-memory fakes: a `MemorySource` over a region map and a builder
//! that lays out a synthetic UE-style target image (module, name pool,
//! object registry, reflection objects), so every layer can be exercised
//! without a live process.
#![cfg(test)]

use std::collections::{BTreeMap, HashMap};
use std::io;

use crate::address::Address;
use crate::discovery::Discovery;
use crate::layout::{LayoutProfile, SelectedLayout, UeVersion};
use crate::model::ModelBuilder;
use crate::names::{parse_name_pool, NameId, NameTable};
use crate::objects::{parse_guobject_array, ObjectTable, PackageIndex};
use crate::pe::PeImage;
use crate::process::{FileVersion, MemoryRegion, MemorySource, ModuleInfo, Process};
use crate::query::QueryEngine;
use crate::events::{CancelToken, Event};

pub fn ue5_profile() -> &'static LayoutProfile {
    SelectedLayout::for_version(UeVersion { major: 5, minor: 1 }).profile
}

/// A fake target process: disjoint readable regions over a `BTreeMap`.
pub struct FakeSource {
    name: String,
    pid: u32,
    regions: BTreeMap<u64, Vec<u8>>,
    modules: Vec<ModuleInfo>,
    file_version: Option<FileVersion>,
}

impl FakeSource {
    pub fn new(name: &str, pid: u32) -> Self {
        Self {
            name: name.to_owned(),
            pid,
            regions: BTreeMap::new(),
            modules: Vec::new(),
            file_version: None,
        }
    }

    pub fn put_region(&mut self, base: Address, bytes: Vec<u8>) {
        self.regions.insert(base.value(), bytes);
    }

    /// Creates a zeroed region at `base` unless one already covers it.
    pub fn ensure_region(&mut self, base: Address, size: u64) {
        if self.region_of(base).is_none() {
            self.put_region(base, vec![0u8; size as usize]);
        }
    }

    pub fn add_module(&mut self, name: &str, base: Address, size: u64) {
        self.modules.push(ModuleInfo {
            name: name.to_owned(),
            base,
            size,
        });
    }

    pub fn set_file_version(&mut self, version: FileVersion) {
        self.file_version = Some(version);
    }

    fn region_of(&self, addr: Address) -> Option<(u64, &Vec<u8>)> {
        let (&base, bytes) = self.regions.range(..=addr.value()).next_back()?;
        (addr.value() < base + bytes.len() as u64).then_some((base, bytes))
    }

    pub fn write_bytes(&mut self, addr: Address, bytes: &[u8]) {
        let (&base, region) = self
            .regions
            .range_mut(..=addr.value())
            .next_back()
            .expect("write outside any region");
        let offset = (addr.value() - base) as usize;
        assert!(
            offset + bytes.len() <= region.len(),
            "write runs past region at {base:#x}"
        );
        region[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn write_u16(&mut self, addr: Address, value: u16) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, addr: Address, value: u32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, addr: Address, value: u64) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_i32(&mut self, addr: Address, value: i32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_i64(&mut self, addr: Address, value: i64) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_f32(&mut self, addr: Address, value: f32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_f64(&mut self, addr: Address, value: f64) {
        self.write_bytes(addr, &value.to_le_bytes());
    }
}

impl MemorySource for FakeSource {
    fn read_bytes_into(&self, addr: Address, buf: &mut [u8]) -> io::Result<()> {
        let (base, bytes) = self
            .region_of(addr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unmapped"))?;
        let offset = (addr.value() - base) as usize;
        if offset + buf.len() > bytes.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
        }
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn modules(&self) -> io::Result<Vec<ModuleInfo>> {
        if !self.modules.is_empty() {
            return Ok(self.modules.clone());
        }
        // Bare region fakes: synthesize one module per region so the
        // module map is never empty.
        Ok(self
            .regions
            .iter()
            .enumerate()
            .map(|(i, (&base, bytes))| ModuleInfo {
                name: if i == 0 {
                    self.name.clone()
                } else {
                    format!("region{i}.dll")
                },
                base: Address::new(base),
                size: bytes.len() as u64,
            })
            .collect())
    }

    fn regions(&self) -> io::Result<Vec<MemoryRegion>> {
        Ok(self
            .regions
            .iter()
            .map(|(&base, bytes)| MemoryRegion {
                base: Address::new(base),
                size: bytes.len() as u64,
                readable: true,
            })
            .collect())
    }

    fn file_version(&self, _module_name: &str) -> Option<FileVersion> {
        self.file_version
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn process_name(&self) -> &str {
        &self.name
    }
}

/// Bytes per name-pool block.
const BLOCK_BYTES: usize = 0x20000;

/// Lays out name-pool blocks the way the engine's allocator does.
pub struct NamePoolBuilder {
    base: Address,
    blocks: Vec<Vec<u8>>,
    ids: HashMap<String, NameId>,
}

impl NamePoolBuilder {
    pub fn new(base: Address) -> Self {
        Self {
            base,
            blocks: vec![Vec::new()],
            ids: HashMap::new(),
        }
    }

    pub fn block_ptr(&self, block: usize) -> Address {
        self.base.add(0x1000 + block as u64 * BLOCK_BYTES as u64)
    }

    pub fn begin_block(&mut self) -> u32 {
        self.blocks.push(Vec::new());
        (self.blocks.len() - 1) as u32
    }

    pub fn add(&mut self, name: &str) -> NameId {
        self.push_entry(name, false)
    }

    pub fn add_wide(&mut self, name: &str) -> NameId {
        self.push_entry(name, true)
    }

    fn push_entry(&mut self, name: &str, wide: bool) -> NameId {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let payload: Vec<u8> = if wide {
            name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
        } else {
            name.as_bytes().to_vec()
        };
        let len = if wide { payload.len() / 2 } else { payload.len() };
        let padded = payload.len().div_ceil(2) * 2;

        if self.blocks.last().unwrap().len() + 2 + padded > BLOCK_BYTES {
            self.begin_block();
        }
        let block_index = self.blocks.len() - 1;
        let block = self.blocks.last_mut().unwrap();
        let offset = block.len();
        let header = ((len as u16) << 6) | wide as u16;
        block.extend_from_slice(&header.to_le_bytes());
        block.extend_from_slice(&payload);
        block.resize(offset + 2 + padded, 0);

        let id = ((block_index as u32) << 16) | (offset as u32 / 2);
        self.ids.insert(name.to_owned(), id);
        id
    }

    /// Appends a bare header whose claimed length runs past the block
    /// cursor, for corruption tests.
    pub fn corrupt_tail(&mut self, claimed_len: u16) {
        let block = self.blocks.last_mut().unwrap();
        block.extend_from_slice(&(claimed_len << 6).to_le_bytes());
    }

    /// Writes the pool header and every block into the fake.
    pub fn install(&self, fake: &mut FakeSource) {
        fake.ensure_region(self.base, 0x1000);
        fake.write_u32(
            self.base.add(0x08),
            (self.blocks.len() - 1) as u32,
        );
        fake.write_u32(
            self.base.add(0x0C),
            self.blocks.last().unwrap().len() as u32,
        );
        for (i, block) in self.blocks.iter().enumerate() {
            let ptr = self.block_ptr(i);
            fake.write_u64(self.base.add(0x10 + 8 * i as u64), ptr.value());
            let mut bytes = block.clone();
            bytes.resize(BLOCK_BYTES, 0);
            fake.put_region(ptr, bytes);
        }
    }
}

/// Writes minimal PE headers at `base`: a DOS header, COFF header, the
/// optional-header fields discovery reads, and two sections (.text at
/// +0x1000, .data at +0x3000).
pub fn write_pe_headers(fake: &mut FakeSource, base: Address, text_size: u64, size_of_image: u64) {
    fake.ensure_region(base, 0x400);
    fake.write_bytes(base, b"MZ");
    fake.write_u32(base.add(0x3C), 0x80);
    let coff = base.add(0x80);
    fake.write_bytes(coff, b"PE\0\0");
    fake.write_u16(coff.add(4), 0x8664);
    fake.write_u16(coff.add(6), 2); // sections
    fake.write_u16(coff.add(20), 0xF0); // optional header size
    let optional = coff.add(24);
    fake.write_u32(optional.add(56), size_of_image as u32);
    let sections = optional.add(0xF0);
    write_section(fake, sections, b".text\0\0\0", 0x1000, text_size as u32, 0x6000_0020);
    write_section(
        fake,
        sections.add(40),
        b".data\0\0\0",
        0x3000,
        0x1000,
        0xC000_0040,
    );
}

fn write_section(
    fake: &mut FakeSource,
    at: Address,
    name: &[u8; 8],
    va: u32,
    vsize: u32,
    characteristics: u32,
) {
    fake.write_bytes(at, name);
    fake.write_u32(at.add(8), vsize);
    fake.write_u32(at.add(12), va);
    fake.write_u32(at.add(36), characteristics);
}

/// A property to lay out on a synthetic class, struct or function.
#[derive(Clone)]
pub struct PropertySpec {
    pub name: String,
    pub kind: &'static str,
    pub offset: u32,
    pub element_size: u32,
    pub array_dim: u32,
    pub flags: u64,
    pub sub_type: SubType,
    /// BoolProperty field mask; `0xFF` means a plain byte bool.
    pub bool_mask: u8,
}

#[derive(Clone)]
pub enum SubType {
    None,
    At(Address),
    Inner(Box<PropertySpec>),
    Map(Box<PropertySpec>, Box<PropertySpec>),
}

impl PropertySpec {
    fn new(name: &str, kind: &'static str, offset: u32, element_size: u32) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            offset,
            element_size,
            array_dim: 1,
            flags: 0,
            sub_type: SubType::None,
            bool_mask: 0xFF,
        }
    }

    pub fn int(name: &str, offset: u32) -> Self {
        Self::new(name, "IntProperty", offset, 4)
    }

    pub fn float(name: &str, offset: u32) -> Self {
        Self::new(name, "FloatProperty", offset, 4)
    }

    pub fn name(name: &str, offset: u32) -> Self {
        Self::new(name, "NameProperty", offset, 8)
    }

    pub fn str(name: &str, offset: u32) -> Self {
        Self::new(name, "StrProperty", offset, 16)
    }

    pub fn object(name: &str, offset: u32, class: Option<Address>) -> Self {
        let mut spec = Self::new(name, "ObjectProperty", offset, 8);
        spec.sub_type = class.map_or(SubType::None, SubType::At);
        spec
    }

    pub fn struct_of(name: &str, offset: u32, struct_addr: Address, size: u32) -> Self {
        let mut spec = Self::new(name, "StructProperty", offset, size);
        spec.sub_type = SubType::At(struct_addr);
        spec
    }

    pub fn byte_enum(name: &str, offset: u32, enum_addr: Address) -> Self {
        let mut spec = Self::new(name, "ByteProperty", offset, 1);
        spec.sub_type = SubType::At(enum_addr);
        spec
    }

    pub fn enum_of(name: &str, offset: u32, enum_addr: Address) -> Self {
        let mut spec = Self::new(name, "EnumProperty", offset, 1);
        spec.sub_type = SubType::At(enum_addr);
        spec
    }

    pub fn bool_plain(name: &str, offset: u32) -> Self {
        Self::new(name, "BoolProperty", offset, 1)
    }

    pub fn bool_bit(name: &str, offset: u32, mask: u8) -> Self {
        let mut spec = Self::new(name, "BoolProperty", offset, 1);
        spec.bool_mask = mask;
        spec
    }

    pub fn array_of(name: &str, offset: u32, inner: PropertySpec) -> Self {
        let mut spec = Self::new(name, "ArrayProperty", offset, 16);
        spec.sub_type = SubType::Inner(Box::new(inner));
        spec
    }

    pub fn map_of(name: &str, offset: u32, key: PropertySpec, value: PropertySpec) -> Self {
        let mut spec = Self::new(name, "MapProperty", offset, 0x50);
        spec.sub_type = SubType::Map(Box::new(key), Box::new(value));
        spec
    }

    pub fn param_float(name: &str, offset: u32, is_return: bool) -> Self {
        let mut spec = Self::new(name, "FloatProperty", offset, 4);
        spec.flags = if is_return { 0x580 } else { 0x80 };
        spec
    }
}

const MODULE_BASE: u64 = 0x1_4000_0000;
const TEXT_RVA: u64 = 0x1000;
const DATA_RVA: u64 = 0x3000;
const POOL_IN_DATA: u64 = 0x0;
const ARRAY_IN_DATA: u64 = 0x100;
const GWORLD_IN_DATA: u64 = 0x200;
const HEAP_BASE: u64 = 0x10_0000_0000;
const PER_CHUNK: u64 = 64;
const MAX_CHUNKS: u64 = 32;

/// Builds a synthetic UE target image: PE module with planted discovery
/// signatures, a name pool, a chunked object registry, and whatever
/// reflection objects a test asks for.
pub struct UeImage {
    pub fake: FakeSource,
    pub plant_signatures: bool,
    profile: &'static LayoutProfile,
    pool: NamePoolBuilder,
    heap_next: u64,
    slots: Vec<Address>,
    field_classes: HashMap<&'static str, Address>,
    core_package: Address,
    class_class: Address,
    package_class: Address,
    struct_class: Address,
    enum_class: Address,
    function_class: Address,
}

impl UeImage {
    pub fn new(major: u32) -> Self {
        let mut fake = FakeSource::new("game.exe", 4242);
        fake.set_file_version(FileVersion {
            major,
            minor: 27,
            patch: 0,
            build: 0,
        });
        let base = Address::new(MODULE_BASE);
        write_pe_headers(&mut fake, base, 0x2000, 0x8000);
        fake.add_module("game.exe", base, 0x8000);
        fake.ensure_region(base.add(DATA_RVA), 0x1000);

        let profile = SelectedLayout::for_version(UeVersion { major, minor: 27 }).profile;
        let mut pool = NamePoolBuilder::new(base.add(DATA_RVA + POOL_IN_DATA));
        pool.add("None");

        let mut image = Self {
            fake,
            plant_signatures: true,
            profile,
            pool,
            heap_next: HEAP_BASE,
            slots: Vec::new(),
            field_classes: HashMap::new(),
            core_package: Address::NULL,
            class_class: Address::NULL,
            package_class: Address::NULL,
            struct_class: Address::NULL,
            enum_class: Address::NULL,
            function_class: Address::NULL,
        };

        // Bootstrap the meta objects every target has.
        let package = image.add_raw_object("/Script/CoreUObject", Address::NULL, Address::NULL, 0x100);
        image.core_package = package;
        let class_class = image.add_raw_object("Class", Address::NULL, package, 0x100);
        image.class_class = class_class;
        image.patch_class(class_class, class_class);
        let package_class = image.add_raw_object("Package", class_class, package, 0x100);
        image.package_class = package_class;
        image.patch_class(package, package_class);
        image.struct_class = image.add_raw_object("ScriptStruct", class_class, package, 0x100);
        image.enum_class = image.add_raw_object("Enum", class_class, package, 0x100);
        image.function_class = image.add_raw_object("Function", class_class, package, 0x100);
        image
    }

    pub fn profile(&self) -> &'static LayoutProfile {
        self.profile
    }

    pub fn core_package(&self) -> Address {
        self.core_package
    }

    pub fn name(&mut self, name: &str) -> NameId {
        self.pool.add(name)
    }

    pub fn alloc(&mut self, size: u64) -> Address {
        let addr = Address::new(self.heap_next);
        self.heap_next += size.div_ceil(16) * 16;
        self.fake.put_region(addr, vec![0u8; size as usize]);
        addr
    }

    pub fn add_empty_slot(&mut self) {
        self.slots.push(Address::NULL);
    }

    fn add_raw_object(
        &mut self,
        name: &str,
        class: Address,
        outer: Address,
        extra: u64,
    ) -> Address {
        let profile = self.profile;
        let id = self.slots.len() as u32;
        let name_id = self.pool.add(name);
        let addr = self.alloc(profile.uobject_outer_offset + 8 + extra);
        self.fake.write_u32(addr.add(profile.uobject_index_offset), id);
        self.fake
            .write_u64(addr.add(profile.uobject_class_offset), class.value());
        self.fake.write_u32(addr.add(profile.uobject_name_offset), name_id);
        self.fake
            .write_u64(addr.add(profile.uobject_outer_offset), outer.value());
        self.slots.push(addr);
        addr
    }

    fn patch_class(&mut self, object: Address, class: Address) {
        self.fake
            .write_u64(object.add(self.profile.uobject_class_offset), class.value());
    }

    pub fn add_package(&mut self, name: &str) -> Address {
        let package_class = self.package_class;
        self.add_raw_object(name, package_class, Address::NULL, 0x40)
    }

    pub fn add_blank_object(
        &mut self,
        name: &str,
        class: Option<Address>,
        outer: Option<Address>,
    ) -> Address {
        self.add_raw_object(
            name,
            class.unwrap_or(Address::NULL),
            outer.unwrap_or(Address::NULL),
            0x40,
        )
    }

    /// A class in the core package with the given super and fields.
    pub fn add_class(
        &mut self,
        name: &str,
        superclass: Option<Address>,
        specs: &[PropertySpec],
    ) -> Address {
        let class_class = self.class_class;
        self.add_struct_like(name, class_class, superclass, specs)
    }

    /// A script struct in the core package.
    pub fn add_script_struct(&mut self, name: &str, specs: &[PropertySpec]) -> Address {
        let struct_class = self.struct_class;
        self.add_struct_like(name, struct_class, None, specs)
    }

    fn add_struct_like(
        &mut self,
        name: &str,
        meta_class: Address,
        superclass: Option<Address>,
        specs: &[PropertySpec],
    ) -> Address {
        let profile = self.profile;
        let core = self.core_package;
        let addr = self.add_raw_object(name, meta_class, core, 0x100);
        if let Some(superclass) = superclass {
            self.fake
                .write_u64(addr.add(profile.ustruct_super_offset), superclass.value());
        }
        let properties_size = specs
            .iter()
            .map(|s| s.offset + s.element_size * s.array_dim)
            .max()
            .unwrap_or(profile.uobject_outer_offset as u32 + 8);
        self.fake.write_u32(
            addr.add(profile.ustruct_properties_size_offset),
            properties_size,
        );
        self.write_field_chain(addr, specs);
        addr
    }

    /// An enum in the core package with ordered `(name, value)` pairs.
    pub fn add_enum(&mut self, name: &str, values: &[(&str, i64)]) -> Address {
        let profile = self.profile;
        let enum_class = self.enum_class;
        let core = self.core_package;
        let addr = self.add_raw_object(name, enum_class, core, 0x100);
        let data = self.alloc(16 * values.len().max(1) as u64);
        for (i, (value_name, value)) in values.iter().enumerate() {
            let id = self.pool.add(value_name);
            self.fake.write_u32(data.add(16 * i as u64), id);
            self.fake.write_i64(data.add(16 * i as u64 + 8), *value);
        }
        let names_array = addr.add(profile.uenum_names_array_offset);
        self.fake.write_u64(names_array, data.value());
        self.fake.write_i32(names_array.add(8), values.len() as i32);
        self.fake.write_i32(names_array.add(12), values.len() as i32);
        addr
    }

    /// A function owned by `owner`, with parameter fields and a native
    /// thunk at `exec_rva` past the module base.
    pub fn add_function(
        &mut self,
        name: &str,
        owner: Address,
        params: &[PropertySpec],
        exec_rva: u64,
    ) -> Address {
        let profile = self.profile;
        let function_class = self.function_class;
        let addr = self.add_raw_object(name, function_class, owner, 0x100);
        self.write_field_chain(addr, params);
        self.fake.write_u64(
            addr.add(profile.ufunction_func_ptr_offset),
            MODULE_BASE + exec_rva,
        );
        addr
    }

    /// A live instance of `class` with `payload` bytes after the header.
    pub fn add_instance(&mut self, name: &str, class: Address, payload: u64) -> Address {
        self.add_raw_object(name, class, Address::NULL, payload)
    }

    /// A `World` class plus an instance wired into the GWorld slot.
    pub fn add_world(&mut self) -> Address {
        let class = self.add_class("World", None, &[]);
        let world = self.add_raw_object("TheWorld", class, Address::NULL, 0x40);
        self.fake.write_u64(self.gworld_slot(), world.value());
        world
    }

    pub fn gworld_slot(&self) -> Address {
        Address::new(MODULE_BASE + DATA_RVA + GWORLD_IN_DATA)
    }

    pub fn name_pool_base(&self) -> Address {
        Address::new(MODULE_BASE + DATA_RVA + POOL_IN_DATA)
    }

    pub fn guobject_array_base(&self) -> Address {
        Address::new(MODULE_BASE + DATA_RVA + ARRAY_IN_DATA)
    }

    fn write_field_chain(&mut self, owner: Address, specs: &[PropertySpec]) {
        let profile = self.profile;
        let head_offset = if profile.uobject_fields_are_fproperty {
            profile.ustruct_children_props_offset
        } else {
            profile.ustruct_children_offset
        };
        let mut previous: Option<Address> = None;
        for spec in specs {
            let node = self.write_field_node(spec);
            match previous {
                None => self.fake.write_u64(owner.add(head_offset), node.value()),
                Some(prev) => self
                    .fake
                    .write_u64(prev.add(profile.ffield_next_offset), node.value()),
            }
            previous = Some(node);
        }
    }

    fn write_field_node(&mut self, spec: &PropertySpec) -> Address {
        let profile = self.profile;
        let node = self.alloc(0xA0);
        let field_class = self.field_class(spec.kind);
        let name_id = self.pool.add(&spec.name);
        self.fake
            .write_u64(node.add(profile.ffield_class_offset), field_class.value());
        self.fake.write_u32(node.add(profile.ffield_name_offset), name_id);
        self.fake
            .write_u32(node.add(profile.fproperty_array_dim), spec.array_dim);
        self.fake
            .write_u32(node.add(profile.fproperty_element_size), spec.element_size);
        self.fake.write_u64(node.add(profile.fproperty_flags), spec.flags);
        self.fake
            .write_u32(node.add(profile.fproperty_offset_internal), spec.offset);

        match &spec.sub_type {
            SubType::None => {}
            SubType::At(addr) => {
                self.fake
                    .write_u64(node.add(profile.fproperty_sub_type), addr.value());
            }
            SubType::Inner(inner) => {
                let inner_node = self.write_field_node(inner);
                self.fake
                    .write_u64(node.add(profile.fproperty_sub_type), inner_node.value());
            }
            SubType::Map(key, value) => {
                let key_node = self.write_field_node(key);
                let value_node = self.write_field_node(value);
                self.fake
                    .write_u64(node.add(profile.fproperty_sub_type), key_node.value());
                self.fake
                    .write_u64(node.add(profile.fproperty_map_value), value_node.value());
            }
        }
        if spec.kind == "BoolProperty" {
            self.fake.write_bytes(
                node.add(profile.fproperty_sub_type),
                &[1, 0, spec.bool_mask, spec.bool_mask],
            );
        }
        node
    }

    /// The meta-class node for a field kind: an FFieldClass in FField
    /// mode, a bare meta object otherwise.
    fn field_class(&mut self, kind: &'static str) -> Address {
        if let Some(&addr) = self.field_classes.get(kind) {
            return addr;
        }
        let name_offset = self.profile.ffield_class_name_offset;
        let node = self.alloc(name_offset + 0x10);
        let id = self.pool.add(kind);
        self.fake.write_u32(node.add(name_offset), id);
        self.field_classes.insert(kind, node);
        node
    }

    /// Finalizes the image: chunk table, pool blocks, planted signatures.
    pub fn into_source(mut self) -> FakeSource {
        let profile = self.profile;
        let item_size = profile.uobject_item_size;

        // Chunked registry.
        let num_chunks = (self.slots.len() as u64).div_ceil(PER_CHUNK).max(1);
        let chunk_dir = self.alloc(8 * num_chunks);
        for chunk in 0..num_chunks {
            let chunk_data = self.alloc(PER_CHUNK * item_size);
            self.fake
                .write_u64(chunk_dir.add(8 * chunk), chunk_data.value());
            for slot in 0..PER_CHUNK {
                let index = (chunk * PER_CHUNK + slot) as usize;
                let Some(&object) = self.slots.get(index) else {
                    break;
                };
                self.fake.write_u64(
                    chunk_data.add(slot * item_size + profile.uobject_item_object_offset),
                    object.value(),
                );
            }
        }
        let array = self.guobject_array_base();
        self.fake.write_u64(array, chunk_dir.value());
        self.fake.write_i32(array.add(0x10), (PER_CHUNK * MAX_CHUNKS) as i32);
        self.fake.write_i32(array.add(0x14), self.slots.len() as i32);
        self.fake.write_i32(array.add(0x18), MAX_CHUNKS as i32);
        self.fake.write_i32(array.add(0x1C), num_chunks as i32);

        // Name pool.
        self.pool.install(&mut self.fake);

        // Executable section with the discovery signatures.
        let text_base = Address::new(MODULE_BASE + TEXT_RVA);
        self.fake.ensure_region(text_base, 0x2000);
        if self.plant_signatures {
            let name_pool_base = self.name_pool_base();
            let guobject_array_base = self.guobject_array_base();
            let gworld_slot = self.gworld_slot();
            plant_rip_site(
                &mut self.fake,
                text_base.add(0x100),
                &[0x74, 0x09, 0x48, 0x8D, 0x15],
                &[0xEB, 0x16, 0x00, 0x00],
                name_pool_base,
            );
            plant_rip_site(
                &mut self.fake,
                text_base.add(0x140),
                &[0x48, 0x8B, 0x05],
                &[0x48, 0x8B, 0x0C, 0xC8, 0x48, 0x8D, 0x04, 0xD1],
                guobject_array_base,
            );
            plant_rip_site(
                &mut self.fake,
                text_base.add(0x180),
                &[0x80, 0x7C, 0x24, 0x00, 0x00, 0x00, 0x00, 0x48, 0x8B, 0x3D],
                &[0x48, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
                gworld_slot,
            );
        }
        self.fake
    }

    /// Finalizes, attaches and parses; panics on any failure since tests
    /// built the image themselves.
    pub fn parse(self) -> TestTarget {
        self.parse_with_events(&mut Vec::new())
    }

    pub fn parse_with_events(self, events: &mut Vec<Event>) -> TestTarget {
        let profile = self.profile;
        let pool_base = self.name_pool_base();
        let array_base = self.guobject_array_base();
        let gworld_slot = self.gworld_slot();

        let process = Process::from_source(Box::new(self.into_source())).unwrap();
        let image = PeImage::read(&process, Address::new(MODULE_BASE)).unwrap();
        let cancel = CancelToken::new();
        let names =
            parse_name_pool(&process, profile, pool_base, &cancel, |e| events.push(e)).unwrap();
        let objects =
            parse_guobject_array(&process, profile, array_base, &names, &cancel, |e| {
                events.push(e)
            })
            .unwrap();
        let packages = PackageIndex::build(&objects);

        TestTarget {
            process,
            image,
            names,
            objects,
            packages,
            profile,
            module_base: Address::new(MODULE_BASE),
            name_pool_base: pool_base,
            guobject_array_base: array_base,
            gworld_slot,
        }
    }
}

/// A fully parsed synthetic target, ready for model and query tests.
pub struct TestTarget {
    pub process: Process,
    pub image: PeImage,
    pub names: NameTable,
    pub objects: ObjectTable,
    pub packages: PackageIndex,
    pub profile: &'static LayoutProfile,
    pub module_base: Address,
    pub name_pool_base: Address,
    pub guobject_array_base: Address,
    pub gworld_slot: Address,
}

impl TestTarget {
    pub fn model_builder(&self) -> ModelBuilder<'_> {
        ModelBuilder {
            process: &self.process,
            profile: self.profile,
            names: &self.names,
            objects: &self.objects,
            module_base: self.module_base,
        }
    }

    pub fn engine(&self) -> QueryEngine<'_> {
        QueryEngine {
            builder: self.model_builder(),
            packages: &self.packages,
        }
    }

    pub fn discovery(&self) -> Discovery<'_> {
        Discovery {
            process: &self.process,
            image: &self.image,
            profile: self.profile,
        }
    }
}

/// Writes `prefix ++ rip32 ++ suffix` at `site`, with the displacement
/// resolving to `target`.
fn plant_rip_site(
    fake: &mut FakeSource,
    site: Address,
    prefix: &[u8],
    suffix: &[u8],
    target: Address,
) {
    fake.write_bytes(site, prefix);
    let operand = site.add(prefix.len() as u64);
    let disp = target.value() as i64 - (operand.value() as i64 + 4);
    fake.write_i32(operand, disp as i32);
    fake.write_bytes(operand.add(4), suffix);
}
