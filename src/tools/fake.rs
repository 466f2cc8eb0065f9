//! Scripted process runner for tests
//!
//! Mimics the observable behaviour of the real tools (files written where
//! the arguments say they go, JSON on stdout for ffprobe) without spawning
//! anything.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Invocation, ProcessOutput, ProcessRunner, ToolError, ToolKind, ToolRegistry};

type Handler = Box<dyn Fn(&Invocation) -> Result<ProcessOutput, ToolError> + Send + Sync>;

pub(crate) struct FakeRunner {
    calls: Mutex<Vec<Invocation>>,
    handler: Handler,
}

impl FakeRunner {
    pub fn new(handler: impl Fn(&Invocation) -> Result<ProcessOutput, ToolError> + Send + Sync + 'static) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        }
    }

    /// Every tool succeeds and writes plausible output
    pub fn simulating() -> Self {
        Self::new(simulate)
    }

    /// The named program exits with code 1, everything else is simulated
    pub fn failing(program: &'static str, stderr: &'static str) -> Self {
        Self::new(move |inv| {
            if program_name(inv) == program {
                Ok(exit(1, "", stderr))
            } else {
                simulate(inv)
            }
        })
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls().iter().map(program_name).collect()
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutput, ToolError> {
        self.calls.lock().unwrap().push(invocation.clone());
        (self.handler)(invocation)
    }
}

/// Registry where every tool lives under `/usr/bin`
pub(crate) fn full_registry() -> ToolRegistry {
    ToolRegistry::from_paths(
        ToolKind::ALL
            .iter()
            .map(|&kind| (kind, PathBuf::from("/usr/bin").join(kind.candidates()[0]))),
    )
}

pub(crate) fn program_name(inv: &Invocation) -> String {
    inv.program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub(crate) fn exit(code: i32, stdout: &str, stderr: &str) -> ProcessOutput {
    ProcessOutput {
        code: Some(code),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

pub(crate) const FAKE_PDF: &[u8] = b"%PDF-1.4\n% fake output\n%%EOF\n";

/// Default behaviour of each tool
pub(crate) fn simulate(inv: &Invocation) -> Result<ProcessOutput, ToolError> {
    match program_name(inv).as_str() {
        "gs" => {
            let Some(target) = inv.value_with_prefix("-sOutputFile=").map(str::to_string) else {
                // nullpage check, nothing written
                return Ok(exit(0, "", ""));
            };
            if inv.value_with_prefix("-sDEVICE=") == Some("png16m") {
                for page in 1..=2 {
                    write(Path::new(&target.replace("%d", &page.to_string())), b"\x89PNG fake");
                }
            } else {
                write(Path::new(&target), FAKE_PDF);
            }
            Ok(exit(0, "", ""))
        }
        "ocrmypdf" | "ffmpeg" => {
            if let Some(out) = inv.last_arg() {
                write(out, FAKE_PDF);
            }
            Ok(exit(0, "", ""))
        }
        "libreoffice" => {
            let outdir = inv.value_after("--outdir").map(Path::to_path_buf).unwrap_or_default();
            let format = inv
                .value_after("--convert-to")
                .and_then(|p| p.to_str())
                .and_then(|f| f.split(':').next())
                .unwrap_or("pdf")
                .to_string();
            if let Some(stem) = inv.last_arg().and_then(|p| p.file_stem()) {
                write(&outdir.join(format!("{}.{}", stem.to_string_lossy(), format)), FAKE_PDF);
            }
            Ok(exit(0, "", ""))
        }
        "ffprobe" => Ok(exit(
            0,
            r#"{"streams":[{"index":1,"codec_type":"audio","codec_name":"aac"}]}"#,
            "",
        )),
        "whisper" => {
            let outdir = inv.value_after("--output_dir").map(Path::to_path_buf).unwrap_or_default();
            if let Some(stem) = inv.args.first().and_then(|a| Path::new(a).file_stem()) {
                write(
                    &outdir.join(format!("{}.txt", stem.to_string_lossy())),
                    b"  ola mundo, isto e um teste \n",
                );
            }
            Ok(exit(0, "", ""))
        }
        other => Ok(exit(127, "", &format!("{}: unexpected program", other))),
    }
}

fn write(path: &Path, data: &[u8]) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    std::fs::write(path, data).unwrap();
}
