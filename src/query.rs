//! Queries over the parsed model: browsing, search, object detail and
//! live property resolution against target memory.
//!
//! Every operation here is read-only over the storage snapshots and
//! re-enters the remote reader for live values. A read fault aborts the
//! one query it happened in; storage is never touched.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::Address;
use crate::error::{Error, Result};
use crate::model::{
    EnumValueEntry, FunctionModel, HierarchyNode, ModelBuilder, PropertyInfo,
};
use crate::objects::{ObjectRecord, PackageIndex};
use crate::wire;

/// Hard cap on global search results.
const SEARCH_CAP: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct PackageSummary {
    pub name: String,
    pub object_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectSummary {
    pub address: Address,
    pub name: String,
    pub full_name: String,
    pub type_name: String,
}

/// The four browsable kinds of reflected objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectCategory {
    Class,
    Struct,
    Enum,
    Function,
}

impl ObjectCategory {
    /// Category membership goes by the record's class name suffix, so
    /// `BlueprintGeneratedClass` objects browse as classes too.
    pub fn matches(self, type_name: &str) -> bool {
        match self {
            Self::Class => type_name.ends_with("Class"),
            Self::Struct => type_name.ends_with("ScriptStruct"),
            Self::Enum => type_name.ends_with("Enum"),
            Self::Function => type_name.ends_with("Function"),
        }
    }

    fn of(type_name: &str) -> Option<Self> {
        [Self::Class, Self::Struct, Self::Enum, Self::Function]
            .into_iter()
            .find(|c| c.matches(type_name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchMode {
    Object,
    Member,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub package: String,
    pub object_name: String,
    pub type_name: String,
    pub address: Address,
    pub member_name: Option<String>,
}

/// Everything `get_object_details` reports about one object.
#[derive(Debug, Clone, Serialize)]
pub struct DetailedObjectInfo {
    pub id: u32,
    pub address: Address,
    pub name: String,
    pub full_name: String,
    pub type_name: String,
    pub package: String,
    pub inheritance: Vec<HierarchyNode>,
    pub properties: Vec<PropertyInfo>,
    pub enum_values: Vec<EnumValueEntry>,
    pub function: Option<FunctionModel>,
    pub properties_size: u32,
}

/// One property of one live instance, decoded.
#[derive(Debug, Clone, Serialize)]
pub struct InstancePropertySample {
    pub property_name: String,
    pub property_type: String,
    pub sub_type: Option<String>,
    /// Offset relative to the owning class, rendered as bare hex.
    #[serde(serialize_with = "wire::offset_hex")]
    pub offset: u32,
    pub memory_address: Address,
    pub live_value: String,
    pub is_object: bool,
    pub object_instance_address: Address,
    pub object_class_address: Address,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceMatch {
    pub instance_address: Address,
    pub object_name: String,
}

/// The resolution engine: a model builder plus the package index.
pub struct QueryEngine<'a> {
    pub builder: ModelBuilder<'a>,
    pub packages: &'a PackageIndex,
}

impl QueryEngine<'_> {
    /// Packages sorted ascending by name.
    pub fn list_packages(&self) -> Vec<PackageSummary> {
        self.packages
            .iter()
            .map(|p| PackageSummary {
                name: p.name.clone(),
                object_count: p.object_ids.len(),
            })
            .collect()
    }

    /// The named package's objects of one category, ordered by name.
    pub fn list_objects(&self, package: &str, category: ObjectCategory) -> Result<Vec<ObjectSummary>> {
        let package = self.packages.get(package).ok_or_else(|| Error::NotFound {
            what: "package",
            key: package.to_owned(),
        })?;
        let mut summaries: Vec<ObjectSummary> = package
            .object_ids
            .iter()
            .filter_map(|&id| self.builder.objects.get(id))
            .filter(|r| category.matches(&r.type_name))
            .map(summary_of)
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    /// Case-insensitive substring search over object names or member
    /// names. Hits are ordered package, then object name, then member
    /// ordinal, and capped.
    pub fn global_search(&self, query: &str, mode: SearchMode) -> Vec<SearchHit> {
        let needle = query.to_lowercase();
        let mut hits = Vec::new();

        let mut records: Vec<&ObjectRecord> = self.builder.objects.iter().collect();
        records.sort_by(|a, b| {
            a.package
                .cmp(&b.package)
                .then_with(|| a.name.cmp(&b.name))
        });

        match mode {
            SearchMode::Object => {
                for record in records {
                    if hits.len() >= SEARCH_CAP {
                        break;
                    }
                    if record.name.to_lowercase().contains(&needle) {
                        hits.push(SearchHit {
                            package: record.package.clone(),
                            object_name: record.name.clone(),
                            type_name: record.type_name.clone(),
                            address: record.address,
                            member_name: None,
                        });
                    }
                }
            }
            SearchMode::Member => {
                for record in records {
                    if hits.len() >= SEARCH_CAP {
                        break;
                    }
                    let members = match self.member_names(record) {
                        Ok(members) => members,
                        Err(error) => {
                            debug!(object = %record.full_name, %error, "member walk failed, skipping");
                            continue;
                        }
                    };
                    for member in members {
                        if hits.len() >= SEARCH_CAP {
                            break;
                        }
                        if member.to_lowercase().contains(&needle) {
                            hits.push(SearchHit {
                                package: record.package.clone(),
                                object_name: record.name.clone(),
                                type_name: record.type_name.clone(),
                                address: record.address,
                                member_name: Some(member),
                            });
                        }
                    }
                }
            }
        }
        hits
    }

    /// Member names in declaration order: properties for classes and
    /// structs, value names for enums.
    fn member_names(&self, record: &ObjectRecord) -> Result<Vec<String>> {
        match ObjectCategory::of(&record.type_name) {
            Some(ObjectCategory::Class) | Some(ObjectCategory::Struct) => Ok(self
                .builder
                .own_properties(record.address)?
                .into_iter()
                .map(|p| p.name)
                .collect()),
            Some(ObjectCategory::Enum) => Ok(self
                .builder
                .enum_model(record)?
                .values
                .into_iter()
                .map(|v| v.name)
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    /// Full detail of the object at `address`.
    pub fn get_object_details(&self, address: Address) -> Result<DetailedObjectInfo> {
        let record = self
            .builder
            .objects
            .by_address(address)
            .ok_or_else(|| Error::NotFound {
                what: "object",
                key: address.to_string(),
            })?;

        let mut info = DetailedObjectInfo {
            id: record.id,
            address: record.address,
            name: record.name.clone(),
            full_name: record.full_name.clone(),
            type_name: record.type_name.clone(),
            package: record.package.clone(),
            inheritance: Vec::new(),
            properties: Vec::new(),
            enum_values: Vec::new(),
            function: None,
            properties_size: 0,
        };

        match ObjectCategory::of(&record.type_name) {
            Some(ObjectCategory::Class) | Some(ObjectCategory::Struct) => {
                let model = self.builder.struct_model(record)?;
                info.inheritance = model.inheritance;
                info.properties = model.properties;
                info.properties_size = model.properties_size;
            }
            Some(ObjectCategory::Enum) => {
                info.enum_values = self.builder.enum_model(record)?.values;
            }
            Some(ObjectCategory::Function) => {
                info.function = Some(self.builder.function_model(record)?);
            }
            None => {
                // A plain instance: report its class's shape.
                if let Some(class) = self.builder.objects.by_address(record.class_ptr) {
                    let model = self.builder.struct_model(class)?;
                    info.inheritance = model.inheritance;
                    info.properties = model.properties;
                    info.properties_size = model.properties_size;
                }
            }
        }
        Ok(info)
    }

    /// The instance's inheritance chain, leaf-most class first, down to
    /// the root type.
    pub fn add_inspector(&self, instance_address: Address) -> Result<Vec<HierarchyNode>> {
        let class_ptr = self
            .builder
            .process
            .read_ptr(instance_address.add(self.builder.profile.uobject_class_offset))
            .map_err(|e| e.while_resolving("instance class"))?;
        self.builder.hierarchy(class_ptr)
    }

    /// Reads every property of the class at `class_address` off the live
    /// instance at `instance_address`.
    pub fn get_instance_details(
        &self,
        instance_address: Address,
        class_address: Address,
    ) -> Result<Vec<InstancePropertySample>> {
        let record = self
            .builder
            .objects
            .by_address(class_address)
            .ok_or_else(|| Error::NotFound {
                what: "class",
                key: class_address.to_string(),
            })?;
        self.builder
            .own_properties(record.address)?
            .iter()
            .map(|p| {
                self.decode_property(p, instance_address)
                    .map_err(|e| e.while_resolving("instance property value"))
            })
            .collect()
    }

    /// Expands `count` container elements starting at `array_address`,
    /// each decoded as `inner_type` at that type's stride.
    pub fn get_array_elements(
        &self,
        array_address: Address,
        inner_type: &str,
        count: u32,
    ) -> Result<Vec<InstancePropertySample>> {
        let stride = decoded_stride(inner_type);
        let element = PropertyInfo {
            name_id: 0,
            name: String::new(),
            property_type_name: inner_type.to_owned(),
            offset: 0,
            element_size: stride as u32,
            array_dim: 1,
            sub_type_name: None,
            sub_type_address: Address::NULL,
            bit_mask: 0,
            flags: 0,
            inner: None,
            value: None,
        };
        (0..count)
            .map(|i| {
                let mut sample =
                    self.decode_property(&element, array_address.add(i as u64 * stride))?;
                sample.property_name = format!("[{i}]");
                Ok(sample)
            })
            .collect()
    }

    /// Every record whose class is, or descends from, the class at
    /// `class_address`.
    pub fn search_object_instances(&self, class_address: Address) -> Result<Vec<InstanceMatch>> {
        let mut chain_memo: HashMap<u64, bool> = HashMap::new();
        let mut matches = Vec::new();
        for record in self.builder.objects.iter() {
            if record.class_ptr.is_null() {
                continue;
            }
            if self.class_chain_contains(record.class_ptr, class_address, &mut chain_memo) {
                matches.push(InstanceMatch {
                    instance_address: record.address,
                    object_name: record.name.clone(),
                });
            }
        }
        Ok(matches)
    }

    /// The declared name of an enum member, when `raw` matches one of the
    /// values of the enum object at `enum_address`.
    fn enum_value_name(&self, enum_address: Address, raw: i64) -> Option<String> {
        let record = self.builder.objects.by_address(enum_address)?;
        let model = self.builder.enum_model(record).ok()?;
        model
            .values
            .into_iter()
            .find(|entry| entry.value == raw)
            .map(|entry| entry.name)
    }

    fn class_chain_contains(
        &self,
        class: Address,
        target: Address,
        memo: &mut HashMap<u64, bool>,
    ) -> bool {
        if let Some(&hit) = memo.get(&class.value()) {
            return hit;
        }
        let mut cursor = class;
        let mut walked = Vec::new();
        let limit = self.builder.objects.len() + 1;
        let mut result = false;
        while !cursor.is_null() && walked.len() < limit {
            if cursor == target {
                result = true;
                break;
            }
            if let Some(&hit) = memo.get(&cursor.value()) {
                result = hit;
                break;
            }
            walked.push(cursor.value());
            cursor = match self
                .builder
                .process
                .read_ptr(cursor.add(self.builder.profile.ustruct_super_offset))
            {
                Ok(next) => next,
                Err(_) => break,
            };
        }
        for addr in walked {
            memo.insert(addr, result);
        }
        result
    }

    /// Decodes one property against a live base address, per the typed
    /// decoder rules.
    fn decode_property(
        &self,
        property: &PropertyInfo,
        base: Address,
    ) -> Result<InstancePropertySample> {
        let process = self.builder.process;
        let at = base.add(property.offset as u64);
        let mut sample = InstancePropertySample {
            property_name: property.name.clone(),
            property_type: property.property_type_name.clone(),
            sub_type: property.sub_type_name.clone(),
            offset: property.offset,
            memory_address: at,
            live_value: String::new(),
            is_object: false,
            object_instance_address: Address::NULL,
            object_class_address: Address::NULL,
        };

        match property.property_type_name.as_str() {
            "Int8Property" => {
                sample.live_value = process.read::<i8>(at)?.to_string();
            }
            "Int16Property" => {
                sample.live_value = process.read::<i16>(at)?.to_string();
            }
            "IntProperty" => {
                sample.live_value = process.read::<i32>(at)?.to_string();
            }
            "Int64Property" => {
                sample.live_value = process.read::<i64>(at)?.to_string();
            }
            "ByteProperty" | "UInt8Property" => {
                sample.live_value = process.read::<u8>(at)?.to_string();
            }
            "UInt16Property" => {
                sample.live_value = process.read::<u16>(at)?.to_string();
            }
            "UInt32Property" => {
                sample.live_value = process.read::<u32>(at)?.to_string();
            }
            "UInt64Property" => {
                sample.live_value = process.read::<u64>(at)?.to_string();
            }
            "FloatProperty" => {
                sample.live_value = format_float(process.read::<f32>(at)? as f64);
            }
            "DoubleProperty" => {
                sample.live_value = format_float(process.read::<f64>(at)?);
            }
            "EnumProperty" => {
                let raw = match property.element_size {
                    2 => process.read::<u16>(at)? as i64,
                    4 => process.read::<u32>(at)? as i64,
                    8 => process.read::<i64>(at)?,
                    _ => process.read::<u8>(at)? as i64,
                };
                sample.live_value = self
                    .enum_value_name(property.sub_type_address, raw)
                    .unwrap_or_else(|| raw.to_string());
            }
            "BoolProperty" => {
                let byte = process.read::<u8>(at)?;
                let set = if property.bit_mask != 0 {
                    byte & property.bit_mask != 0
                } else {
                    byte != 0
                };
                sample.live_value = if set { "True" } else { "False" }.to_owned();
            }
            "NameProperty" => {
                let id = process.read::<u32>(at)?;
                sample.live_value = self.builder.names.resolve_or_none(id).to_owned();
            }
            "StrProperty" => {
                let data = process.read_ptr(at)?;
                let count = process.read::<i32>(at.add(8))?;
                sample.live_value = if data.is_null() || count <= 0 {
                    String::new()
                } else {
                    process.read_wstring(data, count as usize)?
                };
            }
            "TextProperty" => {
                sample.live_value = "FText".to_owned();
            }
            "ObjectProperty" | "ClassProperty" | "InterfaceProperty" | "WeakObjectProperty"
            | "LazyObjectProperty" | "SoftObjectProperty" | "SoftClassProperty" => {
                let target = process.read_ptr(at)?;
                sample.live_value = target.to_string();
                if let Some(pointee) = self.builder.objects.by_address(target) {
                    sample.is_object = true;
                    sample.object_instance_address = target;
                    sample.object_class_address = pointee.class_ptr;
                }
            }
            "ArrayProperty" | "SetProperty" | "MapProperty" => {
                let data = process.read_ptr(at)?;
                let count = process.read::<i32>(at.add(8))?;
                sample.live_value = format!("Elements: {}", count.max(0));
                sample.object_instance_address = data;
                sample.object_class_address = property.sub_type_address;
            }
            "StructProperty" => {
                sample.live_value = property
                    .sub_type_name
                    .clone()
                    .unwrap_or_else(|| "Struct".to_owned());
                sample.object_instance_address = at;
                sample.object_class_address = property.sub_type_address;
            }
            _ => {
                let len = (property.element_size as usize).clamp(1, 8);
                let bytes = process.read_bytes(at, len)?;
                sample.live_value = bytes
                    .iter()
                    .map(|b| format!("{b:02X}"))
                    .collect::<Vec<_>>()
                    .join(" ");
            }
        }

        Ok(sample)
    }
}

fn summary_of(record: &ObjectRecord) -> ObjectSummary {
    ObjectSummary {
        address: record.address,
        name: record.name.clone(),
        full_name: record.full_name.clone(),
        type_name: record.type_name.clone(),
    }
}

/// The element stride used when expanding container elements of a given
/// inner type.
fn decoded_stride(inner_type: &str) -> u64 {
    match inner_type {
        "Int8Property" | "ByteProperty" | "UInt8Property" | "BoolProperty" => 1,
        "Int16Property" | "UInt16Property" => 2,
        "IntProperty" | "UInt32Property" | "FloatProperty" => 4,
        "StrProperty" => 16,
        _ => 8,
    }
}

/// Renders a float with up to six significant digits, trimming trailing
/// zeros.
fn format_float(value: f64) -> String {
    if value == 0.0 {
        return "0".to_owned();
    }
    if !value.is_finite() {
        return value.to_string();
    }
    let magnitude = value.abs().log10().floor() as i32;
    let decimals = (5 - magnitude).clamp(0, 17) as usize;
    let mut rendered = format!("{value:.decimals$}");
    if rendered.contains('.') {
        while rendered.ends_with('0') {
            rendered.pop();
        }
        if rendered.ends_with('.') {
            rendered.pop();
        }
    }
    rendered
}
