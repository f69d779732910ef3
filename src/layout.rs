//! UE version gating and the per-version memory layout profiles.
//!
//! The file-version major is a weak signal: it only selects which profile
//! the walkers use. Discovery never trusts it beyond that and validates
//! every located structure structurally.

use serde::Serialize;

use crate::process::FileVersion;

/// The engine generation the target reports, reduced to what the layout
/// selection actually consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UeVersion {
    pub major: u32,
    pub minor: u32,
}

impl UeVersion {
    pub fn from_file_version(file: FileVersion) -> Self {
        Self {
            major: file.major,
            minor: file.minor,
        }
    }
}

/// Concrete offsets of every target structure the walkers touch.
///
/// One profile per supported UE major. `uobject_fields_are_fproperty`
/// selects between the UField linked list (major 4) and the FField linked
/// list (major 5) when walking a struct's members.
#[derive(Debug, Clone, Copy)]
pub struct LayoutProfile {
    // NamePool
    pub name_block_stride: u64,
    pub name_entry_header_size: u64,
    pub name_header_encodes_length: bool,

    // GUObjectArray items
    pub uobject_item_size: u64,
    pub uobject_item_object_offset: u64,

    // UObject header
    pub uobject_flags_offset: u64,
    pub uobject_index_offset: u64,
    pub uobject_class_offset: u64,
    pub uobject_name_offset: u64,
    pub uobject_outer_offset: u64,

    // UStruct
    pub uobject_fields_are_fproperty: bool,
    pub ustruct_super_offset: u64,
    pub ustruct_children_offset: u64,
    pub ustruct_children_props_offset: u64,
    pub ustruct_properties_size_offset: u64,

    // Field list nodes (FField for major 5, UField/UProperty for major 4)
    pub ffield_next_offset: u64,
    pub ffield_name_offset: u64,
    pub ffield_class_offset: u64,
    /// Where the field's meta-class keeps its own name: an FFieldClass
    /// stores the FName first, a UClass stores it in its UObject header.
    pub ffield_class_name_offset: u64,

    // Property payload
    pub fproperty_array_dim: u64,
    pub fproperty_element_size: u64,
    pub fproperty_flags: u64,
    pub fproperty_offset_internal: u64,
    pub fproperty_sub_type: u64,
    pub fproperty_map_value: u64,

    // Enums and functions
    pub uenum_names_array_offset: u64,
    pub ufunction_flags_offset: u64,
    pub ufunction_func_ptr_offset: u64,

    /// Whether a ByteProperty carries an Enum pointer in its sub-type
    /// slot. Fixed per profile rather than inferred at runtime; a null
    /// pointer simply yields no sub-type.
    pub byte_property_has_enum: bool,
}

/// Major 4: members hang off the UField chain; a property is itself a
/// UObject, so its name and meta-class live in the UObject header.
static UE4: LayoutProfile = LayoutProfile {
    name_block_stride: 2,
    name_entry_header_size: 2,
    name_header_encodes_length: true,

    uobject_item_size: 0x18,
    uobject_item_object_offset: 0x0,

    uobject_flags_offset: 0x08,
    uobject_index_offset: 0x0C,
    uobject_class_offset: 0x10,
    uobject_name_offset: 0x18,
    uobject_outer_offset: 0x20,

    uobject_fields_are_fproperty: false,
    ustruct_super_offset: 0x30,
    ustruct_children_offset: 0x38,
    ustruct_children_props_offset: 0x38,
    ustruct_properties_size_offset: 0x40,

    ffield_next_offset: 0x28,
    ffield_name_offset: 0x18,
    ffield_class_offset: 0x10,
    ffield_class_name_offset: 0x18,

    fproperty_array_dim: 0x30,
    fproperty_element_size: 0x34,
    fproperty_flags: 0x38,
    fproperty_offset_internal: 0x44,
    fproperty_sub_type: 0x70,
    fproperty_map_value: 0x78,

    uenum_names_array_offset: 0x40,
    ufunction_flags_offset: 0x88,
    ufunction_func_ptr_offset: 0xB0,

    byte_property_has_enum: true,
};

/// Major 5: members hang off the FField chain.
static UE5: LayoutProfile = LayoutProfile {
    name_block_stride: 2,
    name_entry_header_size: 2,
    name_header_encodes_length: true,

    uobject_item_size: 0x18,
    uobject_item_object_offset: 0x0,

    uobject_flags_offset: 0x08,
    uobject_index_offset: 0x0C,
    uobject_class_offset: 0x10,
    uobject_name_offset: 0x18,
    uobject_outer_offset: 0x20,

    uobject_fields_are_fproperty: true,
    ustruct_super_offset: 0x40,
    ustruct_children_offset: 0x48,
    ustruct_children_props_offset: 0x50,
    ustruct_properties_size_offset: 0x58,

    ffield_next_offset: 0x20,
    ffield_name_offset: 0x28,
    ffield_class_offset: 0x08,
    ffield_class_name_offset: 0x00,

    fproperty_array_dim: 0x38,
    fproperty_element_size: 0x3C,
    fproperty_flags: 0x40,
    fproperty_offset_internal: 0x4C,
    fproperty_sub_type: 0x78,
    fproperty_map_value: 0x80,

    uenum_names_array_offset: 0x40,
    ufunction_flags_offset: 0xB0,
    ufunction_func_ptr_offset: 0xD8,

    byte_property_has_enum: true,
};

/// A selected profile together with how it was selected.
#[derive(Debug, Clone, Copy)]
pub struct SelectedLayout {
    pub version: UeVersion,
    pub profile: &'static LayoutProfile,
    /// True when no exact profile existed and the nearest neighbor was
    /// substituted.
    pub degraded: bool,
}

impl SelectedLayout {
    /// Picks the profile for a UE major version. Unknown majors fall back
    /// to the nearest neighbor and mark the selection degraded.
    pub fn for_version(version: UeVersion) -> Self {
        let (profile, degraded) = match version.major {
            4 => (&UE4, false),
            5 => (&UE5, false),
            major if major < 4 => (&UE4, true),
            _ => (&UE5, true),
        };
        Self {
            version,
            profile,
            degraded,
        }
    }
}
