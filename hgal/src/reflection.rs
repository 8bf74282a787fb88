//! Shader reflection metadata returned by the driver at shader creation.
//!
//! The distinguished struct named `Material_Properties`, when present, is the
//! declarative schema for material data.

pub const MATERIAL_PROPERTIES_STRUCT_NAME: &str = "Material_Properties";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ShaderDataType {
    Bool,
    S32,
    U32,
    U64,
    F32,
    Vector2F,
    Vector3F,
    Vector4F,
    Matrix3F,
    Matrix4F,
    CombinedImageSampler,
    Struct,
}

impl ShaderDataType {
    /// std140-ish footprint of the type inside a uniform block.
    pub fn size(&self) -> u32 {
        match self {
            ShaderDataType::Bool | ShaderDataType::S32 | ShaderDataType::U32 | ShaderDataType::F32 => 4,
            ShaderDataType::U64 => 8,
            ShaderDataType::Vector2F => 8,
            ShaderDataType::Vector3F => 12,
            ShaderDataType::Vector4F => 16,
            ShaderDataType::Matrix3F => 48,
            ShaderDataType::Matrix4F => 64,
            ShaderDataType::CombinedImageSampler | ShaderDataType::Struct => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShaderStructMember {
    pub name: String,
    pub data_type: ShaderDataType,
    pub offset: u32,
    pub is_array: bool,
    pub array_element_count: i32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShaderStruct {
    pub name: String,
    pub size: u32,
    pub members: Vec<ShaderStructMember>,
}

impl ShaderStruct {
    pub fn member(&self, name: &str) -> Option<&ShaderStructMember> {
        self.members.iter().find(|member| member.name == name)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BindingType {
    UniformBuffer,
    StorageBuffer,
    CombinedImageSampler,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Binding {
    pub binding_type: BindingType,
    pub number: u32,
    pub count: u32,
    pub stage_flags: u32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BindGroupLayoutDescriptor {
    pub bindings: Vec<Binding>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VertexAttribute {
    pub name: String,
    pub location: u32,
    pub binding: u32,
    pub data_type: ShaderDataType,
    pub offset: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
}

/// Everything the driver reflects out of shader bytecode.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShaderReflection {
    /// Descriptor set layouts by group index; `None` for unused slots. At
    /// most [`crate::MAX_BIND_GROUP_INDEX_COUNT`] entries.
    pub sets: Vec<Option<BindGroupLayoutDescriptor>>,
    pub vertex_bindings: Vec<VertexBinding>,
    pub vertex_attributes: Vec<VertexAttribute>,
    pub structs: Vec<ShaderStruct>,
}

impl ShaderReflection {
    pub fn material_properties(&self) -> Option<&ShaderStruct> {
        self.structs
            .iter()
            .find(|shader_struct| shader_struct.name == MATERIAL_PROPERTIES_STRUCT_NAME)
    }

    pub fn set_layout(&self, group_index: u32) -> Option<&BindGroupLayoutDescriptor> {
        self.sets
            .get(group_index as usize)
            .and_then(|layout| layout.as_ref())
    }
}
