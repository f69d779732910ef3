//! Building the reflection model: inheritance, properties, enums and
//! function signatures, read live out of the target.
//!
//! Nothing here is cached. Every builder re-enters the remote reader so
//! the model always reflects the target as it is now; the only stable
//! inputs are the name table and object table snapshots.

use bitflags::bitflags;
use serde::Serialize;

use crate::address::Address;
use crate::error::{Error, Result};
use crate::layout::LayoutProfile;
use crate::names::{NameId, NameTable};
use crate::objects::{ObjectRecord, ObjectTable};
use crate::process::Process;

bitflags! {
    /// The property flags the inspector cares about; everything else is
    /// carried opaquely.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PropertyFlags: u64 {
        const PARM = 0x0000_0080;
        const OUT_PARM = 0x0000_0100;
        const RETURN_PARM = 0x0000_0400;
    }
}

/// One reflected field of a class or script struct.
#[derive(Debug, Clone, Serialize)]
pub struct PropertyInfo {
    pub name_id: NameId,
    pub name: String,
    /// The field's meta-class name, e.g. `ObjectProperty`, `BoolProperty`.
    pub property_type_name: String,
    /// Offset within the owning struct, rendered as bare hex.
    #[serde(serialize_with = "crate::wire::offset_hex")]
    pub offset: u32,
    pub element_size: u32,
    pub array_dim: u32,
    /// Container element type, object class name, struct type name or
    /// byte-enum name, when the kind has one.
    pub sub_type_name: Option<String>,
    /// Resolved cross-reference behind `sub_type_name`, null if none.
    pub sub_type_address: Address,
    /// BoolProperty only; `0` when the bool is not a bitfield.
    pub bit_mask: u8,
    pub flags: u64,
    /// Array/Set element, or Map key.
    pub inner: Option<Box<PropertyInfo>>,
    /// Map value.
    pub value: Option<Box<PropertyInfo>>,
}

/// One step of an inheritance chain.
#[derive(Debug, Clone, Serialize)]
pub struct HierarchyNode {
    pub class_name: String,
    pub class_address: Address,
    pub type_name: String,
}

/// A class or script struct with its inheritance and own fields.
#[derive(Debug, Clone, Serialize)]
pub struct StructModel {
    pub address: Address,
    pub name: String,
    /// Supers above this struct, nearest first. Empty for root types.
    pub inheritance: Vec<HierarchyNode>,
    pub properties: Vec<PropertyInfo>,
    pub properties_size: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnumValueEntry {
    pub name_id: NameId,
    pub name: String,
    pub value: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnumModel {
    pub address: Address,
    pub name: String,
    /// Ordered as declared in the target.
    pub values: Vec<EnumValueEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParamInfo {
    pub name_id: NameId,
    pub name: String,
    pub type_name: String,
    pub type_address: Address,
    pub flags: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionModel {
    pub owner_object_id: Option<u32>,
    pub name: String,
    pub return_type_name: Option<String>,
    pub params: Vec<ParamInfo>,
    /// The native thunk's address relative to the module base.
    pub exec_offset: u64,
}

/// Upper bound on container-property nesting; deeper chains are cut.
const MAX_PROPERTY_DEPTH: u32 = 8;

/// Entries read out of an enum's name array in one go.
const MAX_ENUM_VALUES: usize = 4096;

/// Builds reflection models against the live target.
pub struct ModelBuilder<'a> {
    pub process: &'a Process,
    pub profile: &'static LayoutProfile,
    pub names: &'a NameTable,
    pub objects: &'a ObjectTable,
    pub module_base: Address,
}

impl ModelBuilder<'_> {
    /// The inheritance chain starting at `class_addr` itself, leaf first,
    /// ending at the root type. Bounded by the table size, so a corrupt
    /// cyclic Super chain terminates.
    pub fn hierarchy(&self, class_addr: Address) -> Result<Vec<HierarchyNode>> {
        let mut chain = Vec::new();
        let mut cursor = class_addr;
        let limit = self.objects.len() + 1;
        while !cursor.is_null() && chain.len() < limit {
            let record = self.objects.by_address(cursor).ok_or(Error::NotFound {
                what: "class object",
                key: cursor.to_string(),
            })?;
            chain.push(HierarchyNode {
                class_name: record.name.clone(),
                class_address: record.address,
                type_name: record.type_name.clone(),
            });
            cursor = self
                .process
                .read_ptr(cursor.add(self.profile.ustruct_super_offset))
                .map_err(|e| e.while_resolving("Super"))?;
        }
        Ok(chain)
    }

    /// The full model of one class or script struct record.
    pub fn struct_model(&self, record: &ObjectRecord) -> Result<StructModel> {
        let superclass = self
            .process
            .read_ptr(record.address.add(self.profile.ustruct_super_offset))
            .map_err(|e| e.while_resolving("Super"))?;
        let inheritance = if superclass.is_null() {
            Vec::new()
        } else {
            self.hierarchy(superclass)?
        };
        let properties_size = self
            .process
            .read::<u32>(record.address.add(self.profile.ustruct_properties_size_offset))
            .map_err(|e| e.while_resolving("PropertiesSize"))?;

        Ok(StructModel {
            address: record.address,
            name: record.name.clone(),
            inheritance,
            properties: self.own_properties(record.address)?,
            properties_size,
        })
    }

    /// The fields declared directly on `struct_addr`, in declaration
    /// order. Inherited fields belong to the supers' own models.
    pub fn own_properties(&self, struct_addr: Address) -> Result<Vec<PropertyInfo>> {
        let head_offset = if self.profile.uobject_fields_are_fproperty {
            self.profile.ustruct_children_props_offset
        } else {
            self.profile.ustruct_children_offset
        };
        let mut cursor = self
            .process
            .read_ptr(struct_addr.add(head_offset))
            .map_err(|e| e.while_resolving("Children"))?;

        let mut properties = Vec::new();
        let mut steps = 0;
        while !cursor.is_null() && steps < 4096 {
            let type_name = self.field_class_name(cursor)?;
            if type_name.ends_with("Property") {
                properties.push(self.property_at(cursor, type_name, 0)?);
            }
            cursor = self
                .process
                .read_ptr(cursor.add(self.profile.ffield_next_offset))
                .map_err(|e| e.while_resolving("Next"))?;
            steps += 1;
        }
        Ok(properties)
    }

    /// Resolves a field node's meta-class name. FField nodes keep the
    /// name at the head of their FFieldClass; UField nodes are UObjects
    /// whose meta-class is itself an object in the table.
    fn field_class_name(&self, field_addr: Address) -> Result<String> {
        let class_ptr = self
            .process
            .read_ptr(field_addr.add(self.profile.ffield_class_offset))
            .map_err(|e| e.while_resolving("FieldClass"))?;
        if class_ptr.is_null() {
            return Ok("None".to_owned());
        }
        let name_id = self
            .process
            .read::<u32>(class_ptr.add(self.profile.ffield_class_name_offset))
            .map_err(|e| e.while_resolving("FieldClass name"))?;
        Ok(self.names.resolve_or_none(name_id).to_owned())
    }

    fn property_at(
        &self,
        field_addr: Address,
        property_type_name: String,
        depth: u32,
    ) -> Result<PropertyInfo> {
        let profile = self.profile;
        let name_id = self
            .process
            .read::<u32>(field_addr.add(profile.ffield_name_offset))
            .map_err(|e| e.while_resolving("property name"))?;
        let array_dim = self
            .process
            .read::<u32>(field_addr.add(profile.fproperty_array_dim))
            .map_err(|e| e.while_resolving("ArrayDim"))?;
        let element_size = self
            .process
            .read::<u32>(field_addr.add(profile.fproperty_element_size))
            .map_err(|e| e.while_resolving("ElementSize"))?;
        let flags = self
            .process
            .read::<u64>(field_addr.add(profile.fproperty_flags))
            .map_err(|e| e.while_resolving("PropertyFlags"))?;
        let mut offset = self
            .process
            .read::<u32>(field_addr.add(profile.fproperty_offset_internal))
            .map_err(|e| e.while_resolving("Offset_Internal"))?;

        let mut info = PropertyInfo {
            name_id,
            name: self.names.resolve_or_none(name_id).to_owned(),
            property_type_name,
            offset,
            element_size,
            array_dim,
            sub_type_name: None,
            sub_type_address: Address::NULL,
            bit_mask: 0,
            flags,
            inner: None,
            value: None,
        };

        match info.property_type_name.as_str() {
            "ObjectProperty" | "ClassProperty" | "InterfaceProperty" | "WeakObjectProperty"
            | "LazyObjectProperty" | "SoftObjectProperty" | "SoftClassProperty" => {
                let class = self.sub_type_ptr(field_addr)?;
                info.sub_type_address = class;
                info.sub_type_name = self.object_name_at(class);
            }
            "StructProperty" => {
                let strukt = self.sub_type_ptr(field_addr)?;
                info.sub_type_address = strukt;
                info.sub_type_name = self.object_name_at(strukt);
            }
            "ArrayProperty" | "SetProperty" => {
                if depth < MAX_PROPERTY_DEPTH {
                    let inner_addr = self.sub_type_ptr(field_addr)?;
                    if !inner_addr.is_null() {
                        let inner_type = self.field_class_name(inner_addr)?;
                        let inner = self.property_at(inner_addr, inner_type, depth + 1)?;
                        info.sub_type_name = Some(inner.property_type_name.clone());
                        info.sub_type_address = inner_addr;
                        info.inner = Some(Box::new(inner));
                    }
                }
            }
            "MapProperty" => {
                if depth < MAX_PROPERTY_DEPTH {
                    let key_addr = self.sub_type_ptr(field_addr)?;
                    let value_addr = self
                        .process
                        .read_ptr(field_addr.add(profile.fproperty_map_value))
                        .map_err(|e| e.while_resolving("MapProperty value"))?;
                    if !key_addr.is_null() && !value_addr.is_null() {
                        let key_type = self.field_class_name(key_addr)?;
                        let value_type = self.field_class_name(value_addr)?;
                        let key = self.property_at(key_addr, key_type, depth + 1)?;
                        let value = self.property_at(value_addr, value_type, depth + 1)?;
                        info.sub_type_name = Some(format!(
                            "{},{}",
                            key.property_type_name, value.property_type_name
                        ));
                        info.sub_type_address = key_addr;
                        info.inner = Some(Box::new(key));
                        info.value = Some(Box::new(value));
                    }
                }
            }
            "ByteProperty" if profile.byte_property_has_enum => {
                let enum_ptr = self.sub_type_ptr(field_addr)?;
                if !enum_ptr.is_null() {
                    info.sub_type_address = enum_ptr;
                    info.sub_type_name = self.object_name_at(enum_ptr);
                }
            }
            "EnumProperty" => {
                let enum_ptr = self.sub_type_ptr(field_addr)?;
                info.sub_type_address = enum_ptr;
                info.sub_type_name = self.object_name_at(enum_ptr);
            }
            "BoolProperty" => {
                // FieldSize, ByteOffset, ByteMask, FieldMask.
                let packed = self
                    .process
                    .read::<[u8; 4]>(field_addr.add(profile.fproperty_sub_type))
                    .map_err(|e| e.while_resolving("BoolProperty mask"))?;
                let byte_offset = packed[1];
                let field_mask = packed[3];
                if field_mask != 0xFF {
                    info.bit_mask = field_mask;
                    offset += byte_offset as u32;
                    info.offset = offset;
                }
            }
            _ => {}
        }

        Ok(info)
    }

    fn sub_type_ptr(&self, field_addr: Address) -> Result<Address> {
        self.process
            .read_ptr(field_addr.add(self.profile.fproperty_sub_type))
            .map_err(|e| e.while_resolving("property sub-type"))
    }

    fn object_name_at(&self, addr: Address) -> Option<String> {
        self.objects.by_address(addr).map(|r| r.name.clone())
    }

    /// Reads an enum's ordered `(name, value)` pairs.
    pub fn enum_model(&self, record: &ObjectRecord) -> Result<EnumModel> {
        let names_array = record
            .address
            .add(self.profile.uenum_names_array_offset);
        let data = self
            .process
            .read_ptr(names_array)
            .map_err(|e| e.while_resolving("Enum names"))?;
        let count = self
            .process
            .read::<i32>(names_array.add(8))
            .map_err(|e| e.while_resolving("Enum names count"))?;

        let mut values = Vec::new();
        if !data.is_null() && count > 0 {
            let count = (count as usize).min(MAX_ENUM_VALUES);
            // Each entry is an FName (index + number) followed by an i64.
            let bytes = self
                .process
                .read_bytes(data, count * 16)
                .map_err(|e| e.while_resolving("Enum pairs"))?;
            for i in 0..count {
                let name_id = crate::objects::read_u32(&bytes, i * 16);
                let value = i64::from_le_bytes(bytes[i * 16 + 8..i * 16 + 16].try_into().unwrap());
                values.push(EnumValueEntry {
                    name_id,
                    name: self.names.resolve_or_none(name_id).to_owned(),
                    value,
                });
            }
        }

        Ok(EnumModel {
            address: record.address,
            name: record.name.clone(),
            values,
        })
    }

    /// Reads a function's signature: its parameters are the fields with
    /// the `Parm` flag, the return value the one with `ReturnParm`.
    pub fn function_model(&self, record: &ObjectRecord) -> Result<FunctionModel> {
        let fields = self.own_properties(record.address)?;
        let mut params = Vec::new();
        let mut return_type_name = None;

        for field in fields {
            let flags = PropertyFlags::from_bits_truncate(field.flags);
            if !flags.contains(PropertyFlags::PARM) {
                continue;
            }
            if flags.contains(PropertyFlags::RETURN_PARM) {
                return_type_name = Some(field.property_type_name.clone());
            }
            params.push(ParamInfo {
                name_id: field.name_id,
                name: field.name,
                type_name: field.property_type_name,
                type_address: field.sub_type_address,
                flags: field.flags,
            });
        }

        let func = self
            .process
            .read_ptr(record.address.add(self.profile.ufunction_func_ptr_offset))
            .map_err(|e| e.while_resolving("Func"))?;

        Ok(FunctionModel {
            owner_object_id: self.objects.id_of(record.outer_ptr),
            name: record.name.clone(),
            return_type_name,
            params,
            exec_offset: func.value().wrapping_sub(self.module_base.value()),
        })
    }
}
