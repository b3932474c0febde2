use std::env;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{AutomationOp, OfficeAutomation};
use crate::error::{AssemblyError, Result};

/// Command line of the headless office binary. `{input}` and `{outdir}` are substituted in
/// every argument.
///
/// A plain format conversion does not refresh a table of contents, so `recalculate_args` is
/// empty unless a command that updates indexes (usually a macro) is configured. Without
/// `{outdir}` the command is expected to save the document in place.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SofficeSettings {
    pub program: String,
    pub recalculate_args: Vec<String>,
    pub pdf_args: Vec<String>,
    pub poll_ms: u64,
}

impl Default for SofficeSettings {
    fn default() -> Self {
        let pdf_args = [
            "--headless",
            "--norestore",
            "--convert-to",
            "pdf",
            "--outdir",
            "{outdir}",
            "{input}",
        ];
        Self {
            program: "soffice".to_string(),
            recalculate_args: Vec::new(),
            pdf_args: pdf_args.iter().map(|s| s.to_string()).collect(),
            poll_ms: 100,
        }
    }
}

pub struct SofficeClient {
    settings: SofficeSettings,
}

impl SofficeClient {
    pub fn new(settings: SofficeSettings) -> Self {
        Self { settings }
    }

    fn resolve_program(&self) -> Option<PathBuf> {
        let program = Path::new(&self.settings.program);
        if program.components().count() > 1 {
            return program.is_file().then(|| program.to_path_buf());
        }
        let paths = env::var_os("PATH").unwrap_or_else(OsString::new);
        env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    }

    fn template_for(&self, op: &AutomationOp) -> &[String] {
        match op {
            AutomationOp::RecalculateFields => &self.settings.recalculate_args,
            AutomationOp::ExportPdf { .. } => &self.settings.pdf_args,
        }
    }

    fn command_args(&self, template: &[String], input: &Path, outdir: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let outdir = outdir.to_string_lossy();
        template
            .iter()
            .map(|a| a.replace("{input}", &input).replace("{outdir}", &outdir))
            .collect()
    }

    fn run_converter(&self, args: &[String], log_path: &Path, timeout: Duration) -> Result<()> {
        let program = &self.settings.program;
        let log = File::create(log_path)
            .map_err(|e| AssemblyError::io(format!("create {}", log_path.display()), e))?;
        let mut child = match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .spawn()
        {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AssemblyError::ExternalServiceUnavailable(format!(
                    "`{program}` is not installed"
                )))
            }
            Err(e) => {
                return Err(AssemblyError::ExternalServiceUnavailable(format!(
                    "spawn `{program}` failed: {e}"
                )))
            }
        };

        let started = Instant::now();
        let poll = Duration::from_millis(self.settings.poll_ms.max(1));
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if started.elapsed() > timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(AssemblyError::ExternalServiceUnavailable(format!(
                            "`{program}` timed out after {timeout:?}"
                        )));
                    }
                    thread::sleep(poll);
                }
                Err(e) => {
                    return Err(AssemblyError::ExternalServiceUnavailable(format!(
                        "wait for `{program}` failed: {e}"
                    )))
                }
            }
        };

        if !status.success() {
            let stderr = fs::read_to_string(log_path).unwrap_or_default();
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(5)..].join("\n");
            return Err(AssemblyError::ExternalOperationFailed(format!(
                "`{program}` exited with {status}: {tail}"
            )));
        }
        Ok(())
    }
}

impl OfficeAutomation for SofficeClient {
    fn connect(&mut self) -> Result<()> {
        match self.resolve_program() {
            Some(path) => {
                debug!(program = %path.display(), "office binary found");
                Ok(())
            }
            None => Err(AssemblyError::ExternalServiceUnavailable(format!(
                "`{}` not found",
                self.settings.program
            ))),
        }
    }

    fn supports(&self, op: &AutomationOp) -> bool {
        !self.template_for(op).is_empty()
    }

    fn invoke(&mut self, op: &AutomationOp, document: &Path, timeout: Duration) -> Result<PathBuf> {
        if !self.supports(op) {
            return Err(AssemblyError::ExternalServiceUnavailable(format!(
                "no command configured to {op}"
            )));
        }
        let stem = document
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parent = document.parent().unwrap_or(Path::new("."));
        let scratch = parent.join(format!(".{stem}_automation"));
        fs::create_dir_all(&scratch)
            .map_err(|e| AssemblyError::io(format!("create {}", scratch.display()), e))?;

        let result = match op {
            AutomationOp::RecalculateFields => {
                let template = &self.settings.recalculate_args;
                let in_place = !template.iter().any(|a| a.contains("{outdir}"));
                let args = self.command_args(template, document, &scratch);
                self.run_converter(&args, &scratch.join("converter.log"), timeout)
                    .and_then(|()| {
                        if in_place {
                            return expect_artifact(document);
                        }
                        let ext = document.extension().and_then(|e| e.to_str()).unwrap_or("docx");
                        let produced = expect_artifact(&scratch.join(format!("{stem}.{ext}")))?;
                        fs::rename(&produced, document).map_err(|e| {
                            AssemblyError::io(format!("replace {}", document.display()), e)
                        })?;
                        Ok(document.to_path_buf())
                    })
            }
            AutomationOp::ExportPdf { out_dir } => {
                let args = self.command_args(&self.settings.pdf_args, document, out_dir);
                fs::create_dir_all(out_dir)
                    .map_err(|e| AssemblyError::io(format!("create {}", out_dir.display()), e))
                    .and_then(|()| {
                        self.run_converter(&args, &scratch.join("converter.log"), timeout)
                    })
                    .and_then(|()| expect_artifact(&out_dir.join(format!("{stem}.pdf"))))
            }
        };
        let _ = fs::remove_dir_all(&scratch);
        if let Ok(artifact) = &result {
            info!(%op, artifact = %artifact.display(), "office automation produced artifact");
        }
        result
    }

    fn close(&mut self) -> Result<()> {
        // Each invocation is its own process; nothing stays open between calls.
        Ok(())
    }
}

fn expect_artifact(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        Ok(path.to_path_buf())
    } else {
        Err(AssemblyError::ExternalOperationFailed(format!(
            "no output produced at {}",
            path.display()
        )))
    }
}
