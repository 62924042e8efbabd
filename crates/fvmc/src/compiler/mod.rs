//! Bytecode compiler implementation.

use crate::{bytecode::build_basic_blocks, evm::Revision};
use fvmc_backend::{eyre::ensure, Backend, Linkage, Result};

mod gas;
pub use gas::{schedule, step_cost};
pub(crate) use gas::GasMeter;

mod stack;

mod translate;
use translate::FunctionCx;

/// Compile-time options.
#[derive(Clone, Copy, Debug)]
pub struct CompilerConfig {
    /// The VM specification milestone to compile for.
    pub revision: Revision,
    /// Forbid state-mutating instructions; violations compile to an
    /// out-of-gas exit.
    pub static_call: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self { revision: Revision::Aion, static_call: false }
    }
}

/// Bytecode compiler.
///
/// Translates bytecode into `execute(rt) -> i32` functions of the backend's
/// module. One instance compiles into one module; instances are independent
/// and may run in parallel on disjoint inputs.
pub struct EvmCompiler<B: Backend> {
    backend: B,
    config: CompilerConfig,
}

impl<B: Backend> EvmCompiler<B> {
    /// Creates a new instance of the compiler with the given backend.
    pub fn new(backend: B) -> Self {
        Self { backend, config: CompilerConfig::default() }
    }

    /// Sets the name of the module.
    pub fn set_module_name(&mut self, name: impl AsRef<str>) {
        self.backend.set_module_name(name.as_ref());
    }

    /// Sets the revision to compile for. Defaults to [`Revision::Aion`].
    pub fn set_revision(&mut self, revision: Revision) {
        self.config.revision = revision;
    }

    /// Compiles for a static-call context. Defaults to `false`.
    pub fn set_static_call(&mut self, yes: bool) {
        self.config.static_call = yes;
    }

    pub fn config(&self) -> CompilerConfig {
        self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Translates `code` into a function named `name`.
    ///
    /// Malformed bytecode is not an error: unknown instructions compile to a
    /// runtime out-of-gas exit.
    #[instrument(level = "debug", skip_all, fields(name = name, len = code.len()))]
    pub fn compile(&mut self, name: &str, code: &[u8]) -> Result<B::FuncId> {
        ensure!(self.backend.function_name_is_unique(name), "function name `{name}` is not unique");

        let blocks = build_basic_blocks(code);
        let i32_type = self.backend.type_int(32);
        let ptr_type = self.backend.type_ptr();
        let (bcx, id) = self.backend.build_function(
            name,
            Some(i32_type),
            &[ptr_type],
            &["rt"],
            Linkage::Public,
        )?;
        FunctionCx::<B>::translate(bcx, self.config, code, &blocks);
        self.backend.verify_module()?;
        Ok(id)
    }
}
