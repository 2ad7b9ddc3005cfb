//! Build toolchain: code generation and cross-compilation through cargo.
//!
//! Both passes are external processes; the exit status decides success.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// `cfg` flag set on every deployable build. Crates may gate code on
/// `#[cfg(lambda_binary)]`; crates that never mention it build unchanged.
pub const LAMBDA_CFG: &str = "lambda_binary";

/// Separator cargo uses in `CARGO_ENCODED_RUSTFLAGS`.
const RUSTFLAGS_SEPARATOR: char = '\x1f';

/// Output from an external process.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `program` with `args` in `cwd`, capturing output.
pub fn exec(program: &str, args: &[String], cwd: &Path) -> Result<ExecOutput, String> {
    exec_with_env(program, args, &[], cwd)
}

/// Like [`exec`], with extra environment variables.
pub fn exec_with_env(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    cwd: &Path,
) -> Result<ExecOutput, String> {
    let output = Command::new(program)
        .args(args)
        .envs(envs.iter().map(|(k, v)| (k, v)))
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| format!("failed to spawn {}: {}", program, e))?;

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

fn check(what: &str, out: ExecOutput) -> Result<(), String> {
    if out.success() {
        Ok(())
    } else {
        Err(format!(
            "{} exited with code {}: {}",
            what,
            out.exit_code,
            out.stderr.trim()
        ))
    }
}

/// One compile invocation.
#[derive(Debug, Clone)]
pub struct CompileRequest<'a> {
    pub manifest_dir: &'a Path,
    pub binary: Option<&'a str>,
    pub target: &'a str,
    pub tags: &'a [String],
    pub output: &'a Path,
}

/// Produces the deployable binary.
pub trait Toolchain: Send + Sync {
    /// Code-generation pass, run in `manifest_dir` before compiling.
    /// An empty command skips the pass.
    fn generate(&self, manifest_dir: &Path, command: &[String]) -> Result<(), String>;

    /// Compile and place the binary at `request.output`.
    fn compile(&self, request: &CompileRequest<'_>) -> Result<(), String>;
}

/// Caller tags as cargo features, trimmed and de-duplicated.
pub fn feature_set(tags: &[String]) -> Vec<String> {
    let mut features: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !features.iter().any(|f| f == tag) {
            features.push(tag.to_string());
        }
    }
    features
}

/// `CARGO_ENCODED_RUSTFLAGS` value: the caller's flags (encoded first,
/// else whitespace-split `RUSTFLAGS`) followed by the lambda cfg.
pub fn encoded_rustflags(encoded: Option<&str>, plain: Option<&str>) -> String {
    let mut flags: Vec<String> = match (encoded, plain) {
        (Some(e), _) if !e.is_empty() => e.split(RUSTFLAGS_SEPARATOR).map(str::to_string).collect(),
        (_, Some(p)) => p.split_whitespace().map(str::to_string).collect(),
        _ => Vec::new(),
    };
    flags.extend([
        "--cfg".to_string(),
        LAMBDA_CFG.to_string(),
        "--check-cfg".to_string(),
        format!("cfg({})", LAMBDA_CFG),
    ]);
    flags.join(&RUSTFLAGS_SEPARATOR.to_string())
}

/// `cargo build` arguments for one compile.
pub fn compile_args(request: &CompileRequest<'_>, binary: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "build".into(),
        "--release".into(),
        "--target".into(),
        request.target.to_string(),
        "--bin".into(),
        binary.to_string(),
    ];
    let features = feature_set(request.tags);
    if !features.is_empty() {
        args.push("--features".into());
        args.push(features.join(","));
    }
    args
}

/// Package name from a Cargo manifest.
pub fn package_name(manifest_dir: &Path) -> Result<String, String> {
    let path = manifest_dir.join("Cargo.toml");
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let manifest: toml::Table =
        toml::from_str(&content).map_err(|e| format!("invalid {}: {}", path.display(), e))?;
    manifest
        .get("package")
        .and_then(|p| p.get("name"))
        .and_then(|n| n.as_str())
        .map(str::to_string)
        .ok_or_else(|| format!("{} has no [package] name", path.display()))
}

/// Toolchain driving `cargo`.
#[derive(Debug, Clone)]
pub struct CargoToolchain {
    cargo: String,
}

impl Default for CargoToolchain {
    fn default() -> Self {
        Self {
            cargo: std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string()),
        }
    }
}

impl CargoToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    fn target_dir(manifest_dir: &Path) -> PathBuf {
        std::env::var_os("CARGO_TARGET_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| manifest_dir.join("target"))
    }
}

impl Toolchain for CargoToolchain {
    fn generate(&self, manifest_dir: &Path, command: &[String]) -> Result<(), String> {
        let Some((program, args)) = command.split_first() else {
            tracing::debug!("no code generation command configured");
            return Ok(());
        };
        tracing::info!(dir = %manifest_dir.display(), program = %program, "running code generation");
        let out = exec(program, args, manifest_dir)?;
        check(&format!("code generation ({})", program), out)
    }

    fn compile(&self, request: &CompileRequest<'_>) -> Result<(), String> {
        let binary = match request.binary {
            Some(b) => b.to_string(),
            None => package_name(request.manifest_dir)?,
        };
        let args = compile_args(request, &binary);
        let rustflags = encoded_rustflags(
            std::env::var("CARGO_ENCODED_RUSTFLAGS").ok().as_deref(),
            std::env::var("RUSTFLAGS").ok().as_deref(),
        );
        tracing::info!(triple = request.target, bin = %binary, "compiling");
        let out = exec_with_env(
            &self.cargo,
            &args,
            &[("CARGO_ENCODED_RUSTFLAGS".to_string(), rustflags)],
            request.manifest_dir,
        )?;
        check("cargo build", out)?;

        let built = Self::target_dir(request.manifest_dir)
            .join(request.target)
            .join("release")
            .join(&binary);
        if let Some(parent) = request.output.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
        }
        std::fs::copy(&built, request.output).map_err(|e| {
            format!(
                "cannot copy {} -> {}: {}",
                built.display(),
                request.output.display(),
                e
            )
        })?;
        Ok(())
    }
}

/// Ships an already-built binary instead of compiling.
#[derive(Debug, Clone, Default)]
pub struct PrebuiltToolchain {
    binary: Vec<u8>,
}

impl PrebuiltToolchain {
    pub fn new(binary: Vec<u8>) -> Self {
        Self { binary }
    }

    pub fn from_file(path: &Path) -> Result<Self, String> {
        let binary =
            std::fs::read(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        Ok(Self { binary })
    }
}

impl Toolchain for PrebuiltToolchain {
    fn generate(&self, _manifest_dir: &Path, _command: &[String]) -> Result<(), String> {
        Ok(())
    }

    fn compile(&self, request: &CompileRequest<'_>) -> Result<(), String> {
        if let Some(parent) = request.output.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
        }
        std::fs::write(request.output, &self.binary)
            .map_err(|e| format!("cannot write {}: {}", request.output.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ok = exec("sh", &["-c".into(), "echo hello".into()], dir.path()).unwrap();
        assert!(ok.success());
        assert_eq!(ok.stdout.trim(), "hello");
        let bad = exec("sh", &["-c".into(), "echo nope >&2; exit 42".into()], dir.path()).unwrap();
        assert_eq!(bad.exit_code, 42);
        let err = check("step", bad).unwrap_err();
        assert!(err.contains("code 42"));
        assert!(err.contains("nope"));
    }

    #[test]
    fn test_exec_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        assert!(exec("/nonexistent/bin/tool", &[], dir.path()).is_err());
    }

    fn request<'a>(dir: &'a Path, tags: &'a [String]) -> CompileRequest<'a> {
        CompileRequest {
            manifest_dir: dir,
            binary: None,
            target: "x86_64-unknown-linux-musl",
            tags,
            output: dir,
        }
    }

    #[test]
    fn test_feature_set_keeps_caller_tags_only() {
        assert!(feature_set(&[]).is_empty());
        let tags = vec!["metrics".to_string(), " ".to_string(), "metrics".to_string()];
        assert_eq!(feature_set(&tags), vec!["metrics"]);
    }

    #[test]
    fn test_compile_args_never_name_the_lambda_flag() {
        let dir = tempfile::tempdir().unwrap();
        let args = compile_args(&request(dir.path(), &[]), "hello");
        assert_eq!(
            args,
            vec!["build", "--release", "--target", "x86_64-unknown-linux-musl", "--bin", "hello"]
        );

        let tags = vec!["metrics".to_string()];
        let args = compile_args(&request(dir.path(), &tags), "hello");
        assert_eq!(&args[6..], ["--features", "metrics"]);
        assert!(!args.iter().any(|a| a.contains(LAMBDA_CFG)));
    }

    #[test]
    fn test_encoded_rustflags_append_lambda_cfg() {
        let flags = |s: String| s.split('\x1f').map(str::to_string).collect::<Vec<_>>();
        assert_eq!(
            flags(encoded_rustflags(None, None)),
            vec!["--cfg", LAMBDA_CFG, "--check-cfg", "cfg(lambda_binary)"]
        );
        assert_eq!(
            flags(encoded_rustflags(None, Some("-C  target-cpu=native")))[..3],
            ["-C", "target-cpu=native", "--cfg"]
        );
        assert_eq!(
            flags(encoded_rustflags(Some("-Dwarnings"), Some("-C opt-level=1")))[..2],
            ["-Dwarnings", "--cfg"]
        );
        assert_eq!(flags(encoded_rustflags(Some(""), None))[0], "--cfg");
    }

    #[test]
    fn test_cargo_generate_runs_configured_command() {
        let dir = tempfile::tempdir().unwrap();
        let tc = CargoToolchain::new();
        tc.generate(dir.path(), &[]).unwrap();

        let command: Vec<String> = vec!["sh".into(), "-c".into(), "echo gen > generated.rs".into()];
        tc.generate(dir.path(), &command).unwrap();
        assert!(dir.path().join("generated.rs").exists());

        let failing: Vec<String> = vec!["sh".into(), "-c".into(), "exit 3".into()];
        let err = tc.generate(dir.path(), &failing).unwrap_err();
        assert!(err.contains("code generation (sh)"));
        assert!(err.contains("code 3"));
    }

    #[test]
    fn test_exec_with_env() {
        let dir = tempfile::tempdir().unwrap();
        let out = exec_with_env(
            "sh",
            &["-c".into(), "printf %s \"$STRATUS_TEST_VALUE\"".into()],
            &[("STRATUS_TEST_VALUE".into(), "x".into())],
            dir.path(),
        )
        .unwrap();
        assert_eq!(out.stdout, "x");
    }

    #[test]
    fn test_package_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Cargo.toml"),
            "[package]\nname = \"hello\"\nversion = \"0.1.0\"\n",
        )
        .unwrap();
        assert_eq!(package_name(dir.path()).unwrap(), "hello");
        std::fs::write(dir.path().join("Cargo.toml"), "[workspace]\n").unwrap();
        assert!(package_name(dir.path()).unwrap_err().contains("no [package] name"));
    }

    #[test]
    fn test_prebuilt_writes_binary() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("work").join("bin");
        let tc = PrebuiltToolchain::new(b"ELF".to_vec());
        tc.generate(dir.path(), &["false".to_string()]).unwrap();
        tc.compile(&CompileRequest {
            manifest_dir: dir.path(),
            binary: None,
            target: "x86_64-unknown-linux-musl",
            tags: &[],
            output: &output,
        })
        .unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"ELF");
    }
}
