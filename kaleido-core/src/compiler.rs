//! One-shot pipeline: prelude + source text → wasm module.

use std::path::PathBuf;

use tracing::{debug, info};

use crate::backend::Backend;
use crate::codegen_wasm::WasmBackend;
use crate::driver::{Driver, DriverOptions, UnitOutcome};
use crate::error::CoreError;
use crate::prelude::{PreludeFile, load_prelude_files};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOptions {
    /// Directory of `.kal` files processed before the source. `None`
    /// skips the prelude.
    pub prelude_root: Option<PathBuf>,
    /// Execute top-level expressions instead of compiling them into the
    /// module.
    pub evaluate_top_level: bool,
}

#[derive(Debug)]
pub struct CompilationArtifact {
    pub wasm: Vec<u8>,
    /// `(name, arity)` of the host functions the module imports.
    pub imports: Vec<(String, usize)>,
    pub prelude: Vec<PreludeFile>,
    /// One entry per top-level unit of the source, in order.
    pub outcomes: Vec<UnitOutcome>,
}

impl CompilationArtifact {
    pub fn values(&self) -> Vec<f64> {
        self.outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                UnitOutcome::Evaluated { value } => Some(*value),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &CoreError> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            UnitOutcome::Failed(err) => Some(err),
            _ => None,
        })
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }
}

/// Feed prelude files to `driver`. The first failing unit aborts.
pub fn preload<B: Backend>(
    driver: &mut Driver<B>,
    files: &[PreludeFile],
) -> Result<(), CoreError> {
    for file in files {
        debug!(path = %file.path.display(), "loading prelude file");
        for outcome in driver.process_source(&file.contents) {
            if let UnitOutcome::Failed(err) = outcome {
                return Err(err);
            }
        }
    }
    Ok(())
}

pub fn compile_wasm(
    source: &str,
    options: &CompileOptions,
) -> Result<CompilationArtifact, CoreError> {
    let prelude = match &options.prelude_root {
        Some(root) => load_prelude_files(root)?,
        None => Vec::new(),
    };

    let mut driver = Driver::new(
        WasmBackend::new(),
        DriverOptions {
            evaluate_top_level: options.evaluate_top_level,
        },
    );
    preload(&mut driver, &prelude)?;

    let outcomes = driver.process_source(source);
    let image = driver.session().backend().emit_module()?;
    info!(
        units = outcomes.len(),
        bytes = image.wasm.len(),
        "compiled source to wasm"
    );

    Ok(CompilationArtifact {
        wasm: image.wasm,
        imports: image.imports,
        prelude,
        outcomes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::codegen_wasm::{ModuleImage, run_module};
    use crate::prelude::default_prelude_root;
    use std::fs;

    fn with_prelude(evaluate_top_level: bool) -> CompileOptions {
        CompileOptions {
            prelude_root: Some(default_prelude_root()),
            evaluate_top_level,
        }
    }

    fn validate(wasm: &[u8]) {
        wasmparser::Validator::new()
            .validate_all(wasm)
            .expect("module should validate");
    }

    #[test]
    fn evaluates_against_the_prelude() {
        let artifact = compile_wasm("square(3) + sqrt(16); max(2, 7)", &with_prelude(true))
            .expect("compile should succeed");
        assert!(!artifact.has_failures());
        assert_eq!(artifact.values(), vec![13.0, 7.0]);
        assert!(!artifact.prelude.is_empty());
        validate(&artifact.wasm);
    }

    #[test]
    fn compiled_top_level_expressions_run_from_the_module() {
        let artifact = compile_wasm(
            "def cube : x { x * x * x } cube(3) - 1",
            &with_prelude(false),
        )
        .expect("compile should succeed");
        assert!(matches!(
            &artifact.outcomes[1],
            UnitOutcome::Compiled { name } if name == "__anon_expr1"
        ));
        validate(&artifact.wasm);

        let image = ModuleImage {
            wasm: artifact.wasm.clone(),
            imports: artifact.imports.clone(),
        };
        assert_eq!(run_module(&image, "__anon_expr1").expect("run"), 26.0);
    }

    #[test]
    fn module_imports_only_declared_builtins() {
        let artifact = compile_wasm(
            "import cos : x { } def c : x { cos(x) }",
            &CompileOptions::default(),
        )
        .expect("compile should succeed");
        assert_eq!(artifact.imports, vec![("cos".to_string(), 1)]);
        validate(&artifact.wasm);
    }

    #[test]
    fn unit_failures_are_collected() {
        let options = CompileOptions {
            prelude_root: None,
            evaluate_top_level: true,
        };
        let artifact =
            compile_wasm("sin(0)\n1 + ;\n2 * 3", &options).expect("compile should succeed");
        let failures: Vec<_> = artifact.failures().collect();
        assert_eq!(failures.len(), 2);
        assert!(matches!(failures[0], CoreError::UnknownFunction(name) if name == "sin"));
        assert!(failures[1].is_syntax());
        assert_eq!(artifact.values(), vec![6.0]);
    }

    #[test]
    fn reports_missing_prelude_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = CompileOptions {
            prelude_root: Some(dir.path().join("missing")),
            evaluate_top_level: false,
        };
        let err = compile_wasm("1", &options).unwrap_err();
        assert!(matches!(err, CoreError::MissingPrelude(_)));
    }

    #[test]
    fn broken_prelude_aborts_compilation() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("bad.kal"), "def twice : x { x * 2 } def twice : y { y }")
            .expect("write prelude");
        let options = CompileOptions {
            prelude_root: Some(dir.path().to_path_buf()),
            evaluate_top_level: false,
        };
        let err = compile_wasm("twice(2)", &options).unwrap_err();
        assert!(matches!(err, CoreError::Redefinition(name) if name == "twice"));
    }

    #[test]
    fn runtime_link_errors_surface_per_unit() {
        let options = CompileOptions {
            prelude_root: None,
            evaluate_top_level: true,
        };
        let artifact = compile_wasm("import nowhere : { } nowhere()", &options)
            .expect("compile should succeed");
        let failures: Vec<_> = artifact.failures().collect();
        assert!(matches!(
            failures[0],
            CoreError::Backend(BackendError::UnresolvedImport(name)) if name == "nowhere"
        ));
    }
}
