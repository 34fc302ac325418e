use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::instrument;

/// Exit code kindlegen uses for "built, with warnings".
const BUILT_WITH_WARNINGS: i32 = 1;
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// The kindlegen compiler executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kindlegen {
    path: PathBuf,
}
impl Kindlegen {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Uses the configured binary when given, else searches `PATH`.
    pub fn resolve(configured: Option<&Path>) -> Result<Self> {
        match configured {
            Some(path) if path.is_file() => Ok(Self::new(path)),
            Some(path) => {
                tracing::warn!(path = %path.display(), "Configured kindlegen not found");
                exn::bail!(ErrorKind::CompilerNotFound)
            },
            None => Self::discover(),
        }
    }

    pub fn discover() -> Result<Self> {
        for exe in ["kindlegen", "kindlegen.exe"] {
            if let Ok(path) = which::which(exe) {
                tracing::debug!(path = %path.display(), "Discovered kindlegen");
                return Ok(Self { path });
            }
        }
        tracing::info!("kindlegen executable not found in PATH");
        exn::bail!(ErrorKind::CompilerNotFound);
    }

    /// Compiles `manifest` into `output` (a file name; kindlegen always writes
    /// next to the manifest) and returns the output path.
    ///
    /// Exit codes 0 and 1 (warnings) both count as success as long as the
    /// output exists. A compiler still running at `deadline` is killed and
    /// [`ErrorKind::Timeout`] is returned once it has been reaped.
    #[instrument(skip_all, fields(manifest = %manifest.display()))]
    pub fn compile(&self, manifest: &Path, output: &str, deadline: Option<Instant>) -> Result<PathBuf> {
        let mut child = Command::new(&self.path)
            .arg(manifest)
            .arg("-o")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .or_raise(|| ErrorKind::Io(self.path.clone()))?;
        // kindlegen is chatty; drain its output so a full pipe never stalls it.
        let stdout = child.stdout.take().map(drain);
        let status = self.wait(&mut child, deadline)?;
        let code = status.code().unwrap_or(-1);
        let path = manifest.parent().unwrap_or_else(|| Path::new(".")).join(output);
        match code {
            0 | BUILT_WITH_WARNINGS if path.is_file() => {
                tracing::debug!(code, output = %path.display(), "kindlegen finished");
                Ok(path)
            },
            0 | BUILT_WITH_WARNINGS => exn::bail!(ErrorKind::CompilerOutputMissing(path)),
            code => {
                let stdout = stdout.and_then(|handle| handle.join().ok()).unwrap_or_default();
                tracing::warn!(code, stdout = %String::from_utf8_lossy(&stdout), "kindlegen failed");
                exn::bail!(ErrorKind::CompilerFailed(code))
            },
        }
    }

    fn wait(&self, child: &mut Child, deadline: Option<Instant>) -> Result<ExitStatus> {
        loop {
            if let Some(status) = child.try_wait().or_raise(|| ErrorKind::Io(self.path.clone()))? {
                return Ok(status);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                tracing::warn!(pid = child.id(), "kindlegen exceeded its deadline, killing it");
                if let Err(e) = child.kill() {
                    tracing::warn!(error = %e, "Could not kill kindlegen");
                }
                child.wait().or_raise(|| ErrorKind::Io(self.path.clone()))?;
                exn::bail!(ErrorKind::Timeout);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

fn drain(mut pipe: impl Read + Send + 'static) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buffer) {
            tracing::debug!(error = %e, "Could not read kindlegen output");
        }
        buffer
    })
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use rstest::rstest;
    use std::os::unix::fs::PermissionsExt;

    /// Fake compiler: copies `fixture` to the requested output and exits
    /// with `code`.
    pub(crate) fn fake(dir: &Path, fixture: Option<&Path>, code: i32) -> Kindlegen {
        let copy = match fixture {
            Some(fixture) => format!("cp '{}' \"$(dirname \"$1\")/$3\"\n", fixture.display()),
            None => String::new(),
        };
        let path = dir.join("kindlegen");
        std::fs::write(&path, format!("#!/bin/sh\n{copy}exit {code}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        Kindlegen::new(path)
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    fn test_compile_success(#[case] code: i32) {
        let dir = tempfile::tempdir().unwrap();
        let fixture = dir.path().join("fixture.mobi");
        std::fs::write(&fixture, b"mobi").unwrap();
        let compiler = fake(dir.path(), Some(&fixture), code);
        let book = dir.path().join("book");
        std::fs::create_dir(&book).unwrap();
        let output = compiler.compile(&book.join("content.opf"), "out.mobi", None).unwrap();
        assert_eq!(output, book.join("out.mobi"));
        assert_eq!(std::fs::read(output).unwrap(), b"mobi");
    }

    #[test]
    fn test_compile_failure() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = fake(dir.path(), None, 2);
        let err = compiler.compile(&dir.path().join("content.opf"), "out.mobi", None).unwrap_err();
        assert!(matches!(&*err, ErrorKind::CompilerFailed(2)));
    }

    #[test]
    fn test_compile_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = fake(dir.path(), None, 0);
        let err = compiler.compile(&dir.path().join("content.opf"), "out.mobi", None).unwrap_err();
        assert!(matches!(&*err, ErrorKind::CompilerOutputMissing(_)));
    }

    #[test]
    fn test_compile_killed_at_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("kindlegen");
        let marker = dir.path().join("finished");
        std::fs::write(&script, format!("#!/bin/sh\nsleep 5\ntouch '{}'\n", marker.display())).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let compiler = Kindlegen::new(script);
        let started = Instant::now();
        let deadline = started + Duration::from_millis(100);
        let err = compiler.compile(&dir.path().join("content.opf"), "out.mobi", Some(deadline)).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!marker.exists());
    }

    #[test]
    fn test_resolve_configured() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = fake(dir.path(), None, 0);
        assert_eq!(Kindlegen::resolve(Some(compiler.path())).unwrap(), compiler);
        let err = Kindlegen::resolve(Some(&dir.path().join("missing"))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::CompilerNotFound));
    }
}
