//! Fans unit emission out over a worker pool and joins on the first failure.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context as _, Result};
use log::info;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::emitter::{Emitter, Unit, UnitKind};
use crate::error::TranslateError;
use crate::shim::resolve_imports;
use crate::wasm::Module;
use crate::Config;

/// Units of one run, in a fixed order: function groups first.
///
/// There is always at least one function group, even for a module without
/// defined functions.
pub fn plan(module: &Module<'_>, config: &Config) -> Vec<UnitKind> {
    let groups = group_count(module, config);
    let mut jobs: Vec<UnitKind> = (0..groups).map(UnitKind::Functions).collect();
    jobs.extend([UnitKind::Exports, UnitKind::Bootstrap]);
    if config.runtime_support {
        jobs.extend([UnitKind::Memory, UnitKind::Imports]);
    }
    jobs
}

/// Renders every unit in memory without touching the filesystem.
pub fn render_units(module: &Module<'_>, config: &Config) -> Result<Vec<Unit>> {
    let emitter = prepare(module, config)?;
    let jobs = plan(module, config);
    run(config, &jobs, |kind| render(&emitter, module, config, kind))
}

/// Renders every unit and writes it to `config.out_dir`.
///
/// Returns the written paths, sorted. On failure some files may already have
/// been written; the directory must not be treated as valid output.
pub fn write_units(module: &Module<'_>, config: &Config) -> Result<Vec<PathBuf>> {
    let emitter = prepare(module, config)?;
    let jobs = plan(module, config);
    fs::create_dir_all(&config.out_dir).map_err(|source| TranslateError::EmissionIoFailure {
        path: config.out_dir.clone(),
        source,
    })?;
    let mut paths = run(config, &jobs, |kind| {
        let unit = render(&emitter, module, config, kind)?;
        let path = config.out_dir.join(unit.file_name());
        fs::write(&path, unit.contents).map_err(|source| TranslateError::EmissionIoFailure {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    })?;
    paths.sort();
    Ok(paths)
}

/// Imports are resolved up front so that an unresolved one fails the run
/// before any unit is produced.
fn prepare<'m, 'a>(module: &'m Module<'a>, config: &Config) -> Result<Emitter<'m, 'a>> {
    let imports = resolve_imports(module, &config.overrides)?;
    info!(
        "translating {} functions ({} imported) in {} groups of up to {}",
        module.funcs.len(),
        module.import_count,
        group_count(module, config),
        config.group_size
    );
    Ok(Emitter::new(module, &config.namespace, imports))
}

fn group_count(module: &Module<'_>, config: &Config) -> usize {
    module.defined_funcs().len().div_ceil(config.group_size).max(1)
}

fn render(
    emitter: &Emitter<'_, '_>,
    module: &Module<'_>,
    config: &Config,
    kind: UnitKind,
) -> Result<Unit> {
    match kind {
        UnitKind::Functions(group) => {
            let funcs = module.defined_funcs();
            let start = group * config.group_size;
            let end = (start + config.group_size).min(funcs.len());
            emitter.functions_unit(group, &funcs[start..end])
        }
        UnitKind::Exports => emitter.exports_unit(),
        UnitKind::Bootstrap => emitter.bootstrap_unit(),
        UnitKind::Memory => Ok(emitter.memory_unit()),
        UnitKind::Imports => Ok(emitter.imports_unit()),
    }
}

fn run<T, F>(config: &Config, jobs: &[UnitKind], work: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(UnitKind) -> Result<T> + Sync,
{
    let mut builder = ThreadPoolBuilder::new();
    if let Some(threads) = config.threads {
        builder = builder.num_threads(threads);
    }
    let pool = builder.build().context("failed to start the worker pool")?;

    let failed = AtomicBool::new(false);
    let done = pool.install(|| {
        jobs.par_iter()
            .map(|&kind| {
                if failed.load(Ordering::Relaxed) {
                    return Ok(None);
                }
                let result = work(kind);
                if result.is_err() {
                    failed.store(true, Ordering::Relaxed);
                }
                result.map(Some)
            })
            .collect::<Result<Vec<Option<T>>>>()
    })?;
    Ok(done.into_iter().flatten().collect())
}
