//! Metadata sidecar compiler for a WebAssembly in-place interpreter.
//!
//! The paired interpreter executes the original wasm bytes directly; doing
//! that efficiently means never re-decoding LEB operands and never scanning
//! for a branch target at run time. This crate pays those costs once, ahead
//! of execution: [`generate`] walks one validated function body forward and
//! produces the [`FunctionMetadata`] sidecar — pre-decoded operands, resolved
//! control-flow deltas, exception handler tables, per-loop resumption points,
//! and cached call-marshalling programs.
//!
//! The metadata entry layout is an internal contract with one specific
//! interpreter, not a stable public format.
//!
//! ```no_run
//! let bytes = wat::parse_str("(module (func (result i32) i32.const 42))")?;
//! let module = wasmeta::ModuleInfo::parse(&bytes)?;
//! let (func_index, range) = module.bodies[0].clone();
//! let signature = module.info.function_signature(func_index, 0)?.clone();
//! let metadata = wasmeta::generate(&bytes[range], &signature, &module.info)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod callconv;
mod coalesce;
mod counter;
mod entry;
mod error;
mod generate;
mod metadata;
mod module_info;
mod stream;

pub use callconv::{CallConvention, SlotWidth, ValueLoc};
pub use error::CompileFailure;
pub use metadata::{ExceptionHandler, FunctionMetadata, HandlerKind, ResumePoint};
pub use module_info::{
    GlobalBinding, GlobalInfo, MemoryInfo, ModuleInfo, ParsedModule, TableInfo, TypeDef,
};

use wasmparser::FuncType;

/// Compile one function body into its interpreter metadata.
///
/// `body` is the function's code-section entry (local declarations followed
/// by instructions), already validated by the external decoder. `module`
/// supplies the module-level state the body references. Each call owns an
/// independent generator; nothing is shared across functions.
///
/// On failure no partial artifact is produced.
pub fn generate(
    body: &[u8],
    signature: &FuncType,
    module: &ModuleInfo,
) -> Result<FunctionMetadata, CompileFailure> {
    generate::MetadataGenerator::new(body, signature, module).compile()
}
