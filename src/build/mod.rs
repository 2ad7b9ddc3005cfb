//! Build & package pipeline: compile, then bundle binary, dispatch shim and
//! auxiliary scripts into one deployment archive.

pub mod archive;
pub mod shim;
pub mod toolchain;

use crate::core::error::ProvisionError;
use crate::core::hooks::{self, HookArgs, HookContext, WorkflowHooks};
use crate::core::naming;
use crate::provenance::hasher;
use crate::core::types::{BuildSettings, FunctionDeclaration};
use archive::{ArchiveWriter, BINARY_ENTRY, SHIM_ENTRY};
use std::path::{Path, PathBuf};
use toolchain::{CompileRequest, Toolchain};

/// Support scripts embedded verbatim at the archive root.
pub const AUXILIARY_SCRIPTS: [(&str, &str); 2] = [
    (
        "stratus_utils.sh",
        include_str!("../../resources/provision/stratus_utils.sh"),
    ),
    (
        "runtime-constants.json",
        include_str!("../../resources/provision/runtime-constants.json"),
    ),
];

/// What to build for one run.
#[derive(Debug, Clone, Copy)]
pub struct PackageSpec<'a> {
    pub service_name: &'a str,
    pub functions: &'a [FunctionDeclaration],
    pub settings: &'a BuildSettings,
    pub build_id: &'a str,
}

/// Deterministic local archive path for a build.
pub fn archive_path(settings: &BuildSettings, service_name: &str, build_id: &str) -> PathBuf {
    Path::new(&settings.work_dir).join(format!(
        "{}-{}.zip",
        naming::file_component(service_name),
        naming::file_component(build_id)
    ))
}

/// Removes the compiled binary when packaging ends, on every path.
struct BinaryGuard(PathBuf);

impl Drop for BinaryGuard {
    fn drop(&mut self) {
        if !self.0.exists() {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.0) {
            tracing::warn!(file = %self.0.display(), error = %e, "failed to delete binary");
        }
    }
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Compile the service and write its deployment archive.
pub fn build_and_package(
    toolchain: &dyn Toolchain,
    spec: &PackageSpec<'_>,
    hooks: &WorkflowHooks,
    hook_ctx: &mut HookContext,
    args: &HookArgs,
) -> Result<PathBuf, ProvisionError> {
    hooks::run_build_hooks("pre_build", &hooks.pre_build, hook_ctx, args)?;

    let manifest_dir = Path::new(&spec.settings.manifest_dir);
    toolchain
        .generate(manifest_dir, &spec.settings.generate)
        .map_err(ProvisionError::Build)?;

    let binary_path = Path::new(&spec.settings.work_dir).join(format!(
        "{}.lambda.amd64",
        naming::sanitize(spec.service_name)
    ));
    let _binary = BinaryGuard(binary_path.clone());
    toolchain
        .compile(&CompileRequest {
            manifest_dir,
            binary: spec.settings.binary.as_deref(),
            target: &spec.settings.target,
            tags: &spec.settings.tags,
            output: &binary_path,
        })
        .map_err(ProvisionError::Build)?;
    tracing::info!(bytes = file_size(&binary_path), "binary compiled");

    hooks::run_build_hooks("post_build", &hooks.post_build, hook_ctx, args)?;

    let path = archive_path(spec.settings, spec.service_name, spec.build_id);
    tracing::info!(archive = %path.display(), "creating deployment archive");
    let sealed = write_archive(&path, &binary_path, spec, hooks, hook_ctx, args);
    if sealed.is_err() && path.exists() {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(file = %path.display(), error = %e, "failed to delete partial archive");
        }
    }
    let sealed = sealed?;
    match hasher::hash_file(&sealed) {
        Ok(digest) => tracing::info!(bytes = file_size(&sealed), %digest, "archive sealed"),
        Err(e) => tracing::warn!(error = %e, "cannot hash sealed archive"),
    }
    Ok(sealed)
}

fn write_archive(
    path: &Path,
    binary_path: &Path,
    spec: &PackageSpec<'_>,
    hooks: &WorkflowHooks,
    hook_ctx: &mut HookContext,
    args: &HookArgs,
) -> Result<PathBuf, ProvisionError> {
    let mut writer = ArchiveWriter::create(path).map_err(ProvisionError::Build)?;
    writer
        .add_file(BINARY_ENTRY, binary_path, true)
        .map_err(ProvisionError::Build)?;

    let dispatch = shim::shim_for(spec.service_name, spec.functions);
    tracing::debug!(identifiers = dispatch.len(), "generated dispatch shim");
    writer
        .add_executable(SHIM_ENTRY, dispatch.render().as_bytes())
        .map_err(ProvisionError::Build)?;

    for (name, content) in AUXILIARY_SCRIPTS {
        let added = if name.ends_with(".sh") {
            writer.add_executable(name, content.as_bytes())
        } else {
            writer.add_bytes(name, content.as_bytes())
        };
        added.map_err(ProvisionError::Build)?;
    }

    for (index, hook) in hooks.archive.iter().enumerate() {
        tracing::debug!(hook = "archive", index, "running hook");
        hook.run(hook_ctx, args, &mut writer)
            .map_err(|e| hooks::hook_error("archive", e))?;
    }

    writer.finish().map_err(ProvisionError::Build)
}
