//! Module-level state consumed during metadata generation.
//!
//! The generator never walks module sections itself; everything it needs
//! (global mutability, memory addressing width, type signatures, imported
//! function classification) is collected here up front.

use std::ops::Range;

use wasmparser::{CompositeInnerType, FuncType, Parser, Payload, RefType, TypeRef, ValType};

use crate::error::CompileFailure;

/// How the interpreter reaches a global at run time.
///
/// Instance-local globals live inline in the instance; imported or exported
/// mutable globals are reached through an extra indirection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalBinding {
    Instance = 0,
    Portable = 1,
}

#[derive(Debug, Clone)]
pub struct GlobalInfo {
    pub ty: ValType,
    pub mutable: bool,
    pub binding: GlobalBinding,
}

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub element: RefType,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryInfo {
    /// True for 64-bit memories: memarg offsets need 8-byte entries.
    pub memory64: bool,
    pub shared: bool,
}

/// One type-section entry, reduced to what generation consumes.
#[derive(Debug, Clone)]
pub enum TypeDef {
    Func(FuncType),
    Struct { field_count: u32 },
    Array,
    Other,
}

/// Module-level inputs to per-function metadata generation.
#[derive(Debug, Default, Clone)]
pub struct ModuleInfo {
    /// Type section, in index order.
    pub types: Vec<TypeDef>,
    /// Function index space (imports first): type index per function.
    pub functions: Vec<u32>,
    pub num_imported_functions: u32,
    pub globals: Vec<GlobalInfo>,
    pub tables: Vec<TableInfo>,
    pub memories: Vec<MemoryInfo>,
    /// Exception tag index space: type index per tag.
    pub tags: Vec<u32>,
}

/// A module broken into the pieces generation needs: the collected
/// [`ModuleInfo`] plus the byte range of each local function body.
#[derive(Debug, Default)]
pub struct ParsedModule {
    pub info: ModuleInfo,
    /// (function index, body byte range) per code-section entry.
    pub bodies: Vec<(u32, Range<usize>)>,
}

impl ModuleInfo {
    /// Collect module-level state from a binary module.
    ///
    /// Walks the section payloads once; function bodies are recorded as byte
    /// ranges and left undecoded for [`crate::generate`].
    pub fn parse(bytes: &[u8]) -> Result<ParsedModule, CompileFailure> {
        let mut parsed = ParsedModule::default();
        let info = &mut parsed.info;

        for payload in Parser::new(0).parse_all(bytes) {
            match payload? {
                Payload::TypeSection(reader) => {
                    for group in reader {
                        for sub in group?.types() {
                            info.types.push(match &sub.composite_type.inner {
                                CompositeInnerType::Func(f) => TypeDef::Func(f.clone()),
                                CompositeInnerType::Struct(s) => TypeDef::Struct {
                                    field_count: s.fields.len() as u32,
                                },
                                CompositeInnerType::Array(_) => TypeDef::Array,
                                _ => TypeDef::Other,
                            });
                        }
                    }
                }
                Payload::ImportSection(reader) => {
                    for import in reader {
                        match import?.ty {
                            TypeRef::Func(type_index) => {
                                info.functions.push(type_index);
                                info.num_imported_functions += 1;
                            }
                            TypeRef::Global(ty) => info.globals.push(GlobalInfo {
                                ty: ty.content_type,
                                mutable: ty.mutable,
                                binding: GlobalBinding::Portable,
                            }),
                            TypeRef::Table(ty) => info.tables.push(TableInfo {
                                element: ty.element_type,
                            }),
                            TypeRef::Memory(ty) => info.memories.push(MemoryInfo {
                                memory64: ty.memory64,
                                shared: ty.shared,
                            }),
                            TypeRef::Tag(ty) => info.tags.push(ty.func_type_idx),
                        }
                    }
                }
                Payload::FunctionSection(reader) => {
                    for type_index in reader {
                        info.functions.push(type_index?);
                    }
                }
                Payload::TableSection(reader) => {
                    for table in reader {
                        info.tables.push(TableInfo {
                            element: table?.ty.element_type,
                        });
                    }
                }
                Payload::MemorySection(reader) => {
                    for memory in reader {
                        let ty = memory?;
                        info.memories.push(MemoryInfo {
                            memory64: ty.memory64,
                            shared: ty.shared,
                        });
                    }
                }
                Payload::GlobalSection(reader) => {
                    for global in reader {
                        let ty = global?.ty;
                        info.globals.push(GlobalInfo {
                            ty: ty.content_type,
                            mutable: ty.mutable,
                            binding: GlobalBinding::Instance,
                        });
                    }
                }
                Payload::TagSection(reader) => {
                    for tag in reader {
                        info.tags.push(tag?.func_type_idx);
                    }
                }
                Payload::CodeSectionEntry(body) => {
                    let func_index =
                        info.num_imported_functions + parsed.bodies.len() as u32;
                    parsed.bodies.push((func_index, body.range()));
                }
                _ => {}
            }
        }
        Ok(parsed)
    }

    /// Signature of a type-section entry, failing on non-function types.
    pub fn func_type(&self, type_index: u32, offset: usize) -> Result<&FuncType, CompileFailure> {
        match self.types.get(type_index as usize) {
            Some(TypeDef::Func(sig)) => Ok(sig),
            _ => Err(CompileFailure::new(
                offset,
                format!("type index {type_index} is not a function type"),
            )),
        }
    }

    /// Field count of a struct type, failing on anything else.
    pub fn struct_field_count(
        &self,
        type_index: u32,
        offset: usize,
    ) -> Result<u32, CompileFailure> {
        match self.types.get(type_index as usize) {
            Some(TypeDef::Struct { field_count }) => Ok(*field_count),
            _ => Err(CompileFailure::new(
                offset,
                format!("type index {type_index} is not a struct type"),
            )),
        }
    }

    /// Signature of a function in the function index space.
    pub fn function_signature(
        &self,
        func_index: u32,
        offset: usize,
    ) -> Result<&FuncType, CompileFailure> {
        let type_index = *self.functions.get(func_index as usize).ok_or_else(|| {
            CompileFailure::new(offset, format!("function index {func_index} out of range"))
        })?;
        self.func_type(type_index, offset)
    }

    /// Signature of an exception tag.
    pub fn tag_signature(&self, tag_index: u32, offset: usize) -> Result<&FuncType, CompileFailure> {
        let type_index = *self.tags.get(tag_index as usize).ok_or_else(|| {
            CompileFailure::new(offset, format!("tag index {tag_index} out of range"))
        })?;
        self.func_type(type_index, offset)
    }

    pub fn global(&self, index: u32, offset: usize) -> Result<&GlobalInfo, CompileFailure> {
        self.globals.get(index as usize).ok_or_else(|| {
            CompileFailure::new(offset, format!("global index {index} out of range"))
        })
    }

    /// Whether a memory uses 64-bit addressing (widens memarg entries).
    pub fn memory64(&self, index: u32) -> bool {
        self.memories
            .get(index as usize)
            .is_some_and(|m| m.memory64)
    }

    /// Imported functions relocate tail calls differently from local ones.
    pub fn is_imported_function(&self, func_index: u32) -> bool {
        func_index < self.num_imported_functions
    }
}
