//! Out-of-process model workers
//!
//! The captioning model and the diffusion pipeline are Python programs. Each
//! runs as a child process speaking newline-delimited JSON: one request
//! object on stdin, one response object on stdout.
//!
//! Every request carries an `id` the worker echoes back. Output lines that
//! are not responses (library banners, progress text) are skipped.
//!
//! ```text
//! -> {"id":3,"op":"load_adapter","path":"/workspace/output/style.safetensors"}
//! <- {"id":3,"ok":true,"result":null}
//! ```

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::caption::CaptionModel;
use crate::error::{Error, Result};
use crate::pipeline::{GeneratedImage, GenerationPipeline, SamplingParams, SchedulerConfig};

/// How to start a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the child
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_dir: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// A request line
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerRequest<'a> {
    Caption { image: &'a Path, task: &'a str },
    LoadAdapter { path: &'a Path },
    UnloadAdapter,
    SetScheduler { scheduler: &'a SchedulerConfig },
    Generate { params: &'a SamplingParams },
    Shutdown,
}

impl WorkerRequest<'_> {
    fn op(&self) -> &'static str {
        match self {
            WorkerRequest::Caption { .. } => "caption",
            WorkerRequest::LoadAdapter { .. } => "load_adapter",
            WorkerRequest::UnloadAdapter => "unload_adapter",
            WorkerRequest::SetScheduler { .. } => "set_scheduler",
            WorkerRequest::Generate { .. } => "generate",
            WorkerRequest::Shutdown => "shutdown",
        }
    }
}

/// A request line as written to the worker
#[derive(Debug, Serialize)]
struct Envelope<'a> {
    id: u64,
    #[serde(flatten)]
    request: &'a WorkerRequest<'a>,
}

/// A response line
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkerResponse {
    /// Id of the request this answers
    #[serde(default)]
    pub id: Option<u64>,
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
}

/// How long a worker gets to exit after `shutdown` before it is killed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A running worker child
pub struct WorkerProcess {
    name: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl WorkerProcess {
    /// Start the worker with piped stdio
    pub fn spawn(name: impl Into<String>, command: &WorkerCommand) -> Result<Self> {
        let name = name.into();
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::worker(format!("failed to start {} worker '{}': {}", name, command.program, e))
        })?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::worker(format!("{} worker has no stdout", name)))?;

        info!(worker = %name, program = %command.program, pid = child.id(), "Started worker");
        Ok(Self {
            name,
            child,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 1,
        })
    }

    /// Send one request and wait for its response.
    ///
    /// Lines that do not parse as a response are logged and skipped. A
    /// response carrying another request's id is a worker error, as is a
    /// response with `ok: false`.
    pub fn request(&mut self, request: &WorkerRequest<'_>) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let mut line = serde_json::to_string(&Envelope { id, request })?;
        line.push('\n');
        debug!(worker = %self.name, id, op = request.op(), "Sending request");

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::worker(format!("{} worker stdin closed", self.name)))?;
        stdin
            .write_all(line.as_bytes())
            .and_then(|_| stdin.flush())
            .map_err(|e| Error::worker(format!("{} worker is not accepting requests: {}", self.name, e)))?;

        let response = self.read_response(request.op())?;
        if response.id != Some(id) {
            return Err(Error::worker(format!(
                "{} worker answered '{}' request {} with id {:?}",
                self.name,
                request.op(),
                id,
                response.id
            )));
        }

        if response.ok {
            Ok(response.result)
        } else {
            Err(Error::worker(
                response
                    .error
                    .unwrap_or_else(|| format!("'{}' failed without a message", request.op())),
            ))
        }
    }

    /// Read stdout until a response line arrives
    fn read_response(&mut self, op: &str) -> Result<WorkerResponse> {
        loop {
            let mut reply = String::new();
            if self.stdout.read_line(&mut reply)? == 0 {
                return Err(Error::worker(format!(
                    "{} worker exited while handling '{}'",
                    self.name, op
                )));
            }

            let reply = reply.trim();
            if reply.is_empty() {
                continue;
            }
            match serde_json::from_str::<WorkerResponse>(reply) {
                Ok(response) => return Ok(response),
                Err(e) => warn!(worker = %self.name, line = reply, error = %e, "Skipping non-response output"),
            }
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let shutdown = Envelope {
                id: self.next_id,
                request: &WorkerRequest::Shutdown,
            };
            let _ = serde_json::to_writer(&mut stdin, &shutdown)
                .map_err(std::io::Error::from)
                .and_then(|_| stdin.write_all(b"\n"))
                .and_then(|_| stdin.flush());
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
                Ok(None) | Err(_) => {
                    warn!(worker = %self.name, "Worker did not stop, killing it");
                    if let Err(e) = self.child.kill() {
                        warn!(worker = %self.name, error = %e, "Failed to stop worker");
                    }
                    break;
                }
            }
        }
        let _ = self.child.wait();
        debug!(worker = %self.name, "Worker stopped");
    }
}

/// Captioning model served by a worker
pub struct WorkerCaptioner {
    process: WorkerProcess,
}

impl WorkerCaptioner {
    pub fn spawn(command: &WorkerCommand) -> Result<Self> {
        Ok(Self {
            process: WorkerProcess::spawn("caption", command)?,
        })
    }
}

impl CaptionModel for WorkerCaptioner {
    fn caption(&mut self, image: &Path, task: &str) -> Result<Value> {
        self.process
            .request(&WorkerRequest::Caption { image, task })
            .map_err(|e| Error::caption(image, e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResult {
    images: Vec<String>,
}

/// Diffusion pipeline served by a worker
pub struct WorkerPipeline {
    process: WorkerProcess,
}

impl WorkerPipeline {
    pub fn spawn(command: &WorkerCommand) -> Result<Self> {
        Ok(Self {
            process: WorkerProcess::spawn("pipeline", command)?,
        })
    }
}

impl GenerationPipeline for WorkerPipeline {
    fn load_adapter(&mut self, path: &Path) -> Result<()> {
        self.process.request(&WorkerRequest::LoadAdapter { path })?;
        Ok(())
    }

    fn unload_adapter(&mut self) -> Result<()> {
        self.process.request(&WorkerRequest::UnloadAdapter)?;
        Ok(())
    }

    fn set_scheduler(&mut self, scheduler: &SchedulerConfig) -> Result<()> {
        self.process.request(&WorkerRequest::SetScheduler { scheduler })?;
        Ok(())
    }

    fn generate(&mut self, params: &SamplingParams) -> Result<Vec<GeneratedImage>> {
        let result = self
            .process
            .request(&WorkerRequest::Generate { params })
            .map_err(|e| Error::generation(e.to_string()))?;
        let result: GenerateResult = serde_json::from_value(result)?;

        result
            .images
            .iter()
            .map(|encoded| {
                BASE64
                    .decode(encoded)
                    .map(|png| GeneratedImage { png })
                    .map_err(|e| Error::generation(format!("invalid image payload: {}", e)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encoding() {
        let line = serde_json::to_string(&WorkerRequest::LoadAdapter {
            path: Path::new("/a/style.safetensors"),
        })
        .unwrap();
        assert_eq!(line, r#"{"op":"load_adapter","path":"/a/style.safetensors"}"#);

        let line = serde_json::to_string(&WorkerRequest::UnloadAdapter).unwrap();
        assert_eq!(line, r#"{"op":"unload_adapter"}"#);
    }

    #[test]
    fn test_envelope_puts_id_first() {
        let line = serde_json::to_string(&Envelope {
            id: 7,
            request: &WorkerRequest::Caption {
                image: Path::new("/d/cat.png"),
                task: "<DETAILED_CAPTION>",
            },
        })
        .unwrap();
        assert_eq!(
            line,
            r#"{"id":7,"op":"caption","image":"/d/cat.png","task":"<DETAILED_CAPTION>"}"#
        );
    }

    #[test]
    fn test_response_defaults() {
        let response: WorkerResponse = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        assert!(response.ok);
        assert_eq!(response.result, Value::Null);
        assert_eq!(response.error, None);
    }

    #[test]
    fn test_command_from_yaml() {
        let command: WorkerCommand =
            serde_yaml::from_str("program: python\nargs: [workers/caption.py]\nenv: {HF_HUB_OFFLINE: '1'}")
                .unwrap();
        assert_eq!(
            command,
            WorkerCommand::new("python")
                .arg("workers/caption.py")
                .env("HF_HUB_OFFLINE", "1")
        );
    }

    #[test]
    fn test_spawn_failure_is_worker_error() {
        let err = WorkerCaptioner::spawn(&WorkerCommand::new("/no/such/worker-binary")).err();
        assert!(matches!(err, Some(Error::Worker(_))));
    }

    #[cfg(unix)]
    mod stub {
        use super::*;
        use crate::caption::{extract_caption, CaptionPipeline, DETAILED_CAPTION_TASK};

        const STUB: &str = r##"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed 's/^{"id":\([0-9]*\).*/\1/')
  case "$line" in
    *'"op":"caption"'*) echo "{\"id\":$id,\"ok\":true,\"result\":{\"<DETAILED_CAPTION>\":\"The image shows a dog\"}}" ;;
    *'"op":"load_adapter"'*) echo "{\"id\":$id,\"ok\":false,\"error\":\"corrupt weights\"}" ;;
    *'"op":"generate"'*) echo "{\"id\":$id,\"ok\":true,\"result\":{\"images\":[\"iVBORw==\"]}}" ;;
    *'"op":"shutdown"'*) exit 0 ;;
    *) echo "{\"id\":$id,\"ok\":true,\"result\":null}" ;;
  esac
done
"##;

        /// Prints a banner before serving, then captions each image by its stem
        const NOISY_STUB: &str = r##"
echo 'Loading checkpoint shards: 100%'
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed 's/^{"id":\([0-9]*\).*/\1/')
  case "$line" in
    *'"op":"caption"'*)
      image=$(printf '%s' "$line" | sed 's/.*"image":"\([^"]*\)".*/\1/')
      stem=$(basename "$image" .png)
      echo "progress: $stem"
      echo "{\"id\":$id,\"ok\":true,\"result\":\"caption of $stem\"}" ;;
    *'"op":"shutdown"'*) exit 0 ;;
  esac
done
"##;

        fn stub_command() -> WorkerCommand {
            WorkerCommand::new("sh").arg("-c").arg(STUB)
        }

        #[test]
        fn test_captioner_round_trip() {
            let mut captioner = WorkerCaptioner::spawn(&stub_command()).unwrap();
            let answer = captioner
                .caption(Path::new("/d/dog.png"), DETAILED_CAPTION_TASK)
                .unwrap();
            assert_eq!(extract_caption(&answer, DETAILED_CAPTION_TASK), "The image shows a dog");
        }

        #[test]
        fn test_pipeline_round_trip() {
            let mut pipeline = WorkerPipeline::spawn(&stub_command()).unwrap();
            pipeline.set_scheduler(&SchedulerConfig::default()).unwrap();
            pipeline.unload_adapter().unwrap();

            let err = pipeline.load_adapter(Path::new("/a/x.safetensors")).unwrap_err();
            assert_eq!(err.to_string(), "Worker error: corrupt weights");

            let params = SamplingParams {
                prompt: "a cat".to_string(),
                steps: 20,
                guidance_scale: 3.5,
                count: 1,
                width: 1024,
                height: 1024,
                seed: None,
            };
            let images = pipeline.generate(&params).unwrap();
            assert_eq!(images, vec![GeneratedImage { png: b"\x89PNG".to_vec() }]);
        }

        #[test]
        fn test_banner_lines_do_not_shift_replies() {
            let dir = tempfile::TempDir::new().unwrap();
            for name in ["a.png", "b.png", "c.png"] {
                std::fs::write(dir.path().join(name), b"img").unwrap();
            }
            let command = WorkerCommand::new("sh").arg("-c").arg(NOISY_STUB);
            let mut pipeline = CaptionPipeline::new(move || {
                let model: Box<dyn CaptionModel> = Box::new(WorkerCaptioner::spawn(&command)?);
                Ok(model)
            });

            let report = pipeline.process_folder(dir.path()).unwrap();
            assert_eq!(report.captioned.len(), 3);
            assert!(report.failed.is_empty());
            for stem in ["a", "b", "c"] {
                let label = std::fs::read_to_string(dir.path().join(format!("{}.txt", stem))).unwrap();
                assert_eq!(label, format!("caption of {}", stem));
            }
        }

        #[test]
        fn test_mismatched_reply_id_is_rejected() {
            let command = WorkerCommand::new("sh")
                .arg("-c")
                .arg(r#"read -r line; echo '{"id":99,"ok":true,"result":null}'; read -r line"#);
            let mut process = WorkerProcess::spawn("confused", &command).unwrap();
            let err = process.request(&WorkerRequest::UnloadAdapter).unwrap_err();
            assert!(matches!(err, Error::Worker(_)));
            assert!(err.to_string().contains("Some(99)"));
        }

        #[test]
        fn test_drop_lets_worker_exit_on_shutdown() {
            let dir = tempfile::TempDir::new().unwrap();
            let marker = dir.path().join("stopped");
            let script = format!(
                r#"while IFS= read -r line; do case "$line" in *'"op":"shutdown"'*) touch '{}'; exit 0 ;; esac; done"#,
                marker.display()
            );
            let process = WorkerProcess::spawn("graceful", &WorkerCommand::new("sh").arg("-c").arg(script)).unwrap();
            drop(process);
            assert!(marker.exists());
        }

        #[test]
        fn test_worker_exit_is_reported() {
            let command = WorkerCommand::new("sh").arg("-c").arg("exit 0");
            let mut process = WorkerProcess::spawn("short-lived", &command).unwrap();
            assert!(matches!(
                process.request(&WorkerRequest::UnloadAdapter),
                Err(Error::Worker(_))
            ));
        }
    }
}
