use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, trace};

const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// どの出力を走査するか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// stdout と stderr の両方（ssh）
    Combined,
    /// stderr のみ。stdout は捨てる（cloudflared）
    StderrOnly,
}

/// 起動するコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub capture: Capture,
}

impl LaunchCommand {
    pub fn new(program: impl Into<PathBuf>, capture: Capture) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            capture,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// 起動済みのトンネルプロセス
#[async_trait]
pub trait TunnelProcess: Send + Sync {
    fn id(&self) -> Option<u32>;

    /// プロセスを終了させて回収する
    async fn terminate(&mut self) -> io::Result<()>;
}

/// 起動したプロセスと、その出力行
pub struct Spawned {
    pub output: mpsc::Receiver<String>,
    pub process: Box<dyn TunnelProcess>,
}

#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(&self, command: &LaunchCommand) -> io::Result<Spawned>;
}

/// tokio::process で実際にプロセスを起動する
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSpawner;

#[async_trait]
impl Spawner for SystemSpawner {
    async fn spawn(&self, command: &LaunchCommand) -> io::Result<Spawned> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match command.capture {
            Capture::Combined => cmd.stdout(Stdio::piped()),
            Capture::StderrOnly => cmd.stdout(Stdio::null()),
        };

        let mut child = cmd.spawn()?;
        debug!(
            "Spawned {} (pid {:?})",
            command.program.display(),
            child.id()
        );

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        Ok(Spawned {
            output: rx,
            process: Box::new(ChildProcess { child }),
        })
    }
}

/// パイプを1行ずつチャネルへ送る
///
/// 受信側がいなくなってもパイプは読み続ける。読まないと子プロセスが書き込みでブロックする。
/// UTF-8 でないバイトは置換文字にして読み進める。
async fn forward_lines<R: AsyncRead + Unpin>(pipe: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    let mut receiver_alive = true;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = decode_line(&buf);
                if receiver_alive {
                    receiver_alive = tx.send(line).await.is_ok();
                } else {
                    trace!("{}", line);
                }
            }
            Err(e) => {
                debug!("Failed to read subprocess output: {}", e);
                break;
            }
        }
    }
}

/// 改行（\n / \r\n）を除いて文字列にする
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl TunnelProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn terminate(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

// スクリプト化した出力を返すテスト用 Spawner
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// 1回の起動で出力する内容
    #[derive(Clone, Default)]
    pub struct Script {
        pub lines: Vec<String>,
        /// true ならストリームを閉じずに保持する（ハングするプロセス）
        pub hold_open: bool,
        pub fail_spawn: bool,
    }

    impl Script {
        pub fn lines(lines: &[&str]) -> Self {
            Self {
                lines: lines.iter().map(|l| l.to_string()).collect(),
                ..Default::default()
            }
        }

        pub fn hanging(lines: &[&str]) -> Self {
            Self {
                hold_open: true,
                ..Self::lines(lines)
            }
        }

        pub fn spawn_error() -> Self {
            Self {
                fail_spawn: true,
                ..Default::default()
            }
        }
    }

    #[derive(Clone, Default)]
    pub struct ScriptedSpawner {
        scripts: Arc<Mutex<VecDeque<Script>>>,
        commands: Arc<Mutex<Vec<LaunchCommand>>>,
        terminated: Arc<AtomicUsize>,
    }

    impl ScriptedSpawner {
        pub fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: Arc::new(Mutex::new(scripts.into())),
                ..Default::default()
            }
        }

        pub fn spawn_count(&self) -> usize {
            self.commands.lock().unwrap().len()
        }

        pub fn commands(&self) -> Vec<LaunchCommand> {
            self.commands.lock().unwrap().clone()
        }

        pub fn terminated(&self) -> usize {
            self.terminated.load(Ordering::SeqCst)
        }
    }

    struct FakeProcess {
        id: u32,
        terminated: Arc<AtomicUsize>,
        _hold: Option<mpsc::Sender<String>>,
    }

    #[async_trait]
    impl TunnelProcess for FakeProcess {
        fn id(&self) -> Option<u32> {
            Some(self.id)
        }

        async fn terminate(&mut self) -> io::Result<()> {
            self.terminated.fetch_add(1, Ordering::SeqCst);
            self._hold = None;
            Ok(())
        }
    }

    #[async_trait]
    impl Spawner for ScriptedSpawner {
        async fn spawn(&self, command: &LaunchCommand) -> io::Result<Spawned> {
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            if script.fail_spawn {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such program"));
            }

            let id = {
                let mut commands = self.commands.lock().unwrap();
                commands.push(command.clone());
                commands.len() as u32
            };

            let (tx, rx) = mpsc::channel(script.lines.len().max(1));
            for line in script.lines {
                tx.try_send(line).unwrap();
            }

            Ok(Spawned {
                output: rx,
                process: Box::new(FakeProcess {
                    id,
                    terminated: self.terminated.clone(),
                    _hold: script.hold_open.then_some(tx),
                }),
            })
        }
    }
}
