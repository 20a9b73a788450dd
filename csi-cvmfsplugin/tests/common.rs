//! In-memory host for the plugin: a mount table that `mount` and `umount`
//! commands act on, scripted `cvmfs_talk` answers and a fake `stat`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cvmfsplugin::exec::{Cmd, CommandRunner, ExecError};
use cvmfsplugin::mountutil::{Kernel, MountEntry, MountError};
use nix::errno::Errno;
use tokio::sync::Notify;

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum TalkReply {
    Mountpoint(String),
    Refused,
    NotRunning,
    Other(String),
}

#[derive(Default)]
struct State {
    mounts: Vec<MountEntry>,
    commands: Vec<Cmd>,
    talk: HashMap<String, TalkReply>,
    stat_errno: HashMap<PathBuf, Errno>,
    stat_calls: Vec<PathBuf>,
    failing: HashMap<String, String>,
    autofs_after: Option<u32>,
    autofs_attempts: u32,
    mount_gate: Option<MountGate>,
    mount_table_broken: bool,
}

/// Holds `mount` commands until released.
#[derive(Clone, Default)]
pub struct MountGate {
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[derive(Default)]
pub struct FakeHost {
    state: Mutex<State>,
}

#[allow(dead_code)]
impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_mount(&self, mount_point: impl Into<PathBuf>, fs_type: &str) {
        self.state
            .lock()
            .unwrap()
            .mounts
            .push(MountEntry::new(mount_point, fs_type));
    }

    pub fn mounts(&self) -> Vec<MountEntry> {
        self.state.lock().unwrap().mounts.clone()
    }

    pub fn set_talk(&self, repo: &str, reply: TalkReply) {
        self.state
            .lock()
            .unwrap()
            .talk
            .insert(repo.to_string(), reply);
    }

    pub fn set_stat_errno(&self, path: impl Into<PathBuf>, errno: Errno) {
        self.state
            .lock()
            .unwrap()
            .stat_errno
            .insert(path.into(), errno);
    }

    /// Make every run of `program` fail with `output`.
    pub fn fail(&self, program: &str, output: &str) {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(program.to_string(), output.to_string());
    }

    /// autofs turns up on the `attempt`-th check, `None` never.
    pub fn autofs_after(&self, attempt: Option<u32>) {
        self.state.lock().unwrap().autofs_after = attempt;
    }

    pub fn autofs_attempts(&self) -> u32 {
        self.state.lock().unwrap().autofs_attempts
    }

    /// Make reads of the mount table fail until switched back.
    pub fn break_mount_table(&self, broken: bool) {
        self.state.lock().unwrap().mount_table_broken = broken;
    }

    pub fn block_mounts(&self) -> MountGate {
        let gate = MountGate::default();
        self.state.lock().unwrap().mount_gate = Some(gate.clone());
        gate
    }

    /// Every command run so far, formatted as a shell line.
    pub fn commands(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    pub fn commands_of(&self, program: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|c| c.program == program)
            .map(ToString::to_string)
            .collect()
    }

    pub fn stat_calls(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().stat_calls.clone()
    }

    fn exit(cmd: &Cmd, code: i32, output: String) -> ExecError {
        ExecError::Exit {
            program: cmd.program.clone(),
            code,
            output,
        }
    }

    fn mount(&self, cmd: &Cmd) -> Result<Vec<u8>, ExecError> {
        let mut state = self.state.lock().unwrap();
        let args: Vec<&str> = cmd.args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["--bind", _from, to] => state.mounts.push(MountEntry::new(*to, "fuse")),
            [_from, to, "--rbind", "--make-slave"] => {
                state.mounts.push(MountEntry::new(*to, "autofs"))
            }
            ["--make-shared", _] => {}
            other => return Err(Self::exit(cmd, 1, format!("mount: bad usage {other:?}\n"))),
        }
        Ok(Vec::new())
    }

    fn umount(&self, cmd: &Cmd) -> Result<Vec<u8>, ExecError> {
        let mut state = self.state.lock().unwrap();
        let Some(target) = cmd.args.last().map(PathBuf::from) else {
            return Err(Self::exit(cmd, 1, "umount: bad usage\n".to_string()));
        };
        let recursive = cmd.args.iter().any(|a| a == "--recursive");

        let before = state.mounts.len();
        state.mounts.retain(|m| {
            if recursive {
                !m.mount_point.starts_with(&target)
            } else {
                m.mount_point != target
            }
        });

        if state.mounts.len() == before {
            return Err(Self::exit(
                cmd,
                32,
                format!("umount: {}: not mounted.\n", target.display()),
            ));
        }
        Ok(Vec::new())
    }

    fn talk(&self, cmd: &Cmd) -> Result<Vec<u8>, ExecError> {
        let state = self.state.lock().unwrap();
        let repo = cmd.args.get(1).cloned().unwrap_or_default();
        let reply = state
            .talk
            .get(&repo)
            .cloned()
            .unwrap_or(TalkReply::Other(format!("no reply scripted for {repo}\n")));
        match reply {
            TalkReply::Mountpoint(p) => Ok(format!("{p}\n").into_bytes()),
            TalkReply::Refused => Err(Self::exit(
                cmd,
                1,
                format!(
                    "Couldn't connect to socket /var/lib/cvmfs/shared/cvmfs_io.{repo} (111 - Connection refused)\n"
                ),
            )),
            TalkReply::NotRunning => Err(Self::exit(
                cmd,
                1,
                "Seems like CernVM-FS is not running in /var/lib/cvmfs/shared\n".to_string(),
            )),
            TalkReply::Other(out) => Err(Self::exit(cmd, 1, out)),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeHost {
    async fn combined_output(&self, cmd: &Cmd) -> Result<Vec<u8>, ExecError> {
        let (failure, gate) = {
            let mut state = self.state.lock().unwrap();
            state.commands.push(cmd.clone());
            (state.failing.get(&cmd.program).cloned(), state.mount_gate.clone())
        };

        if let Some(output) = failure {
            return Err(Self::exit(cmd, 1, output));
        }

        match cmd.program.as_str() {
            "mount" => {
                if let Some(gate) = gate {
                    gate.started.notify_one();
                    gate.release.notified().await;
                }
                self.mount(cmd)
            }
            "umount" => self.umount(cmd),
            "cvmfs_talk" => self.talk(cmd),
            "cvmfs_config" => Ok(Vec::new()),
            "cvmfs2" => Ok(b"CernVM-FS version 2.11.2\n".to_vec()),
            _ => Err(ExecError::Spawn {
                program: cmd.program.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
        }
    }
}

impl Kernel for FakeHost {
    fn mounts(&self) -> Result<Vec<MountEntry>, MountError> {
        let state = self.state.lock().unwrap();
        if state.mount_table_broken {
            return Err(MountError::MountTable(
                "/proc/self/mountinfo: Input/output error".to_string(),
            ));
        }
        Ok(state.mounts.clone())
    }

    fn stat(&self, path: &Path) -> Result<(), Errno> {
        let mut state = self.state.lock().unwrap();
        state.stat_calls.push(path.to_path_buf());
        match state.stat_errno.get(path) {
            Some(errno) => Err(*errno),
            None => Ok(()),
        }
    }

    fn is_autofs(&self, _path: &Path) -> Result<bool, Errno> {
        let mut state = self.state.lock().unwrap();
        state.autofs_attempts += 1;
        Ok(state
            .autofs_after
            .is_some_and(|n| state.autofs_attempts >= n))
    }
}
