use crate::{Recognition, RecognizeError};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const STDERR_KEEP_LINES: usize = 200;
const STARTUP_DRAIN_MS: u64 = 200;
const SLOW_CALL_WARN_THRESHOLD_MS: u128 = 8_000;

/// 参数模板中的模型路径占位符
pub const MODEL_PLACEHOLDER: &str = "{model}";

/// 识别引擎返回码
pub mod error_code {
    // 成功类
    pub const OK_WITH_MARKS: u32 = 100; // 检测到涂点
    pub const OK_NO_MARKS: u32 = 101; // 未检测到任何涂点（空白卡，正常）

    // 路径/文件类错误 (2xx) - 数据问题，不需重启
    pub const ERR_PATH_NOT_EXIST: u32 = 200;
    pub const ERR_PATH_ENCODE: u32 = 201;
    pub const ERR_FILE_OPEN: u32 = 202;
    pub const ERR_IMAGE_DECODE: u32 = 203;

    // 版面类错误 (3xx) - 数据问题，不需重启
    pub const ERR_SHEET_NOT_FOUND: u32 = 300;
    pub const ERR_LAYOUT_DECODE: u32 = 301;

    // JSON/引擎类错误 (4xx) - 需要重启
    pub const ERR_JSON_DUMP: u32 = 400;
    pub const ERR_JSON_PARSE: u32 = 401;
    pub const ERR_JSON_KEY: u32 = 402;
    pub const ERR_NO_TASK: u32 = 403;

    #[inline]
    pub fn is_success(code: u32) -> bool {
        matches!(code, OK_WITH_MARKS | OK_NO_MARKS)
    }

    #[inline]
    pub fn is_data_error(code: u32) -> bool {
        matches!(code, 200..=203 | 300..=301)
    }

    pub fn description(code: u32) -> &'static str {
        match code {
            100 => "识别成功",
            101 => "未检测到涂点",
            200 => "图片路径不存在",
            201 => "路径编码转换失败",
            202 => "无法打开文件",
            203 => "图片无法解码",
            300 => "未检测到答题卡版面",
            301 => "答题卡版面解析失败",
            400 => "JSON序列化失败",
            401 => "JSON反序列化失败",
            402 => "JSON键解析失败",
            403 => "未发现有效任务",
            _ => "未知错误",
        }
    }
}

/// 引擎启动选项（由上层配置传入）
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub binary: PathBuf,
    /// 启动参数，`{model}` 会被替换为模型路径
    pub args: Vec<String>,
    pub model_path: PathBuf,
    pub work_dir: Option<PathBuf>,
    pub lib_path: Option<PathBuf>,
    pub response_timeout_secs: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("omr/omr-engine"),
            args: vec!["--model".to_string(), MODEL_PLACEHOLDER.to_string()],
            model_path: PathBuf::from("best.pt"),
            work_dir: None,
            lib_path: None,
            response_timeout_secs: 30,
        }
    }
}

impl EngineOptions {
    fn resolved_args(&self) -> Vec<String> {
        let model = self.model_path.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace(MODEL_PLACEHOLDER, &model))
            .collect()
    }
}

#[derive(Serialize)]
struct EngineRequest<'a> {
    image_path: &'a str,
}

#[derive(Deserialize, Debug)]
struct EngineReply {
    code: u32,
    #[serde(default)]
    data: Value,
}

/// 解析引擎的一行应答
pub fn parse_reply(line: &str) -> Result<Recognition, RecognizeError> {
    let reply: EngineReply = serde_json::from_str(line.trim())
        .map_err(|e| RecognizeError::Protocol(format!("{}: {}", e, line.trim())))?;

    match reply.code {
        error_code::OK_NO_MARKS => match reply.data {
            Value::Object(_) => Recognition::from_payload(reply.data),
            _ => Ok(Recognition::default()),
        },
        error_code::OK_WITH_MARKS => Recognition::from_payload(reply.data),
        code if error_code::is_data_error(code) => Err(RecognizeError::Rejected {
            code,
            message: reply_message(code, &reply.data),
        }),
        code => Err(RecognizeError::Engine {
            code,
            message: reply_message(code, &reply.data),
        }),
    }
}

fn reply_message(code: u32, data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        Value::Null => error_code::description(code).to_string(),
        other => other.to_string(),
    }
}

/// 单个识别引擎子进程
///
/// 协议：每次写入一行 `{"image_path": "..."}`，读取第一行 JSON 应答。
pub struct EngineProcess {
    process: Child,
    stdin: ChildStdin,
    receiver: Receiver<String>,
    stderr_recent: Arc<Mutex<VecDeque<String>>>,
    options: EngineOptions,
    consecutive_failures: u32,
}

impl EngineProcess {
    pub fn spawn(options: EngineOptions) -> Result<Self, RecognizeError> {
        let mut command = Command::new(&options.binary);
        command
            .args(options.resolved_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &options.work_dir {
            command.current_dir(dir);
        }
        if let Some(lib) = &options.lib_path {
            command.env("LD_LIBRARY_PATH", lib);
        }

        let mut process = command.spawn().map_err(RecognizeError::Spawn)?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| RecognizeError::Spawn(io::Error::other("engine stdin not piped")))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| RecognizeError::Spawn(io::Error::other("engine stdout not piped")))?;
        let stderr = process
            .stderr
            .take()
            .ok_or_else(|| RecognizeError::Spawn(io::Error::other("engine stderr not piped")))?;

        let (sender, receiver) = bounded::<String>(64);
        std::thread::Builder::new()
            .name("omr-engine-stdout".to_string())
            .spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    let Ok(line) = line else { break };
                    if sender.send(line).is_err() {
                        break;
                    }
                }
            })
            .map_err(RecognizeError::Spawn)?;

        // stderr 只保留最近若干行，用于错误诊断
        let stderr_recent = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_KEEP_LINES)));
        let stderr_sink = stderr_recent.clone();
        std::thread::Builder::new()
            .name("omr-engine-stderr".to_string())
            .spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines() {
                    let Ok(line) = line else { break };
                    let mut buf = stderr_sink.lock();
                    if buf.len() >= STDERR_KEEP_LINES {
                        buf.pop_front();
                    }
                    buf.push_back(line);
                }
            })
            .map_err(RecognizeError::Spawn)?;

        // 丢弃启动横幅；stdout 已关闭说明进程启动即退出
        let stdout_closed = loop {
            match receiver.recv_timeout(Duration::from_millis(STARTUP_DRAIN_MS)) {
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => break false,
                Err(RecvTimeoutError::Disconnected) => break true,
            }
        };

        let mut engine = Self {
            process,
            stdin,
            receiver,
            stderr_recent,
            options,
            consecutive_failures: 0,
        };

        if stdout_closed || !engine.is_running() {
            let tail = engine.stderr_tail(5).join(" | ");
            return Err(RecognizeError::Spawn(io::Error::other(format!(
                "engine exited during startup: {}",
                tail
            ))));
        }

        info!(
            event = "engine.spawned",
            pid = engine.process.id(),
            binary = %engine.options.binary.display()
        );
        Ok(engine)
    }

    /// 识别一张暂存图片
    pub fn recognize(&mut self, image_path: &Path) -> Result<Recognition, RecognizeError> {
        let started = Instant::now();
        let absolute = if image_path.is_absolute() {
            image_path.to_path_buf()
        } else {
            std::env::current_dir()?.join(image_path)
        };
        let path_text = absolute.to_string_lossy();
        debug!(event = "engine.request", image = %path_text);

        // 上一次超时后迟到的应答不能串到本次
        while self.receiver.try_recv().is_ok() {}

        let request = serde_json::to_string(&EngineRequest {
            image_path: &path_text,
        })
        .map_err(|e| RecognizeError::Protocol(e.to_string()))?;
        writeln!(self.stdin, "{}", request)?;
        self.stdin.flush()?;

        let line = self.read_json_line()?;

        let elapsed = started.elapsed();
        if elapsed.as_millis() > SLOW_CALL_WARN_THRESHOLD_MS {
            warn!(
                event = "engine.slow_call",
                duration_ms = elapsed.as_millis() as u64,
                "单次识别耗时超出阈值"
            );
        }

        let result = parse_reply(&line);
        match &result {
            Ok(recognition) => {
                self.consecutive_failures = 0;
                debug!(
                    event = "engine.reply",
                    answers = recognition.answers.len(),
                    duration_ms = elapsed.as_millis() as u64
                );
            }
            Err(err) if err.is_engine_fault() => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            }
            Err(_) => {}
        }
        result
    }

    fn read_json_line(&mut self) -> Result<String, RecognizeError> {
        let timeout = self.options.response_timeout_secs.max(1);
        let deadline = Instant::now() + Duration::from_secs(timeout);
        loop {
            let remain = deadline.saturating_duration_since(Instant::now());
            if remain.is_zero() {
                return Err(RecognizeError::Timeout(timeout));
            }
            match self.receiver.recv_timeout(remain) {
                Ok(line) => {
                    if line.trim_start().starts_with('{') {
                        return Ok(line);
                    }
                    // 跳过引擎的非 JSON 日志行
                    continue;
                }
                Err(RecvTimeoutError::Timeout) => return Err(RecognizeError::Timeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => {
                    let tail = self.stderr_tail(5).join(" | ");
                    return Err(RecognizeError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("engine stdout closed: {}", tail),
                    )));
                }
            }
        }
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }

    /// 用同样的启动参数替换为新进程，旧进程随 drop 被杀掉
    pub fn restart(&mut self) -> Result<(), RecognizeError> {
        warn!(
            event = "engine.restart",
            pid = self.process.id(),
            consecutive_failures = self.consecutive_failures
        );
        let fresh = Self::spawn(self.options.clone())?;
        *self = fresh;
        Ok(())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn stderr_tail(&self, lines: usize) -> Vec<String> {
        let buf = self.stderr_recent.lock();
        buf.iter()
            .skip(buf.len().saturating_sub(lines))
            .cloned()
            .collect()
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        self.process.kill().ok();
        self.process.wait().ok();
    }
}
