//! Simulated guest for unit tests.
//!
//! [`SimHost`] lays out sysfs, `/dev` and a mountinfo file under a scratch
//! directory and answers the storage tools the crate shells out to from an
//! in-memory model of block device contents.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use diskattach_shared::errors::{DiskError, DiskResult};
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::export::{Endpoint, ExportServer, ServerProcess};
use crate::image::DiskImage;
use crate::mount::Mounter;
use crate::util::{CommandOutput, CommandRunner, CommandSpec, HostPaths, Readiness};

/// Sectors reported for an attached device (1 GiB).
const SIM_DEVICE_SECTORS: u64 = 2 * 1024 * 1024;

/// Contents of a simulated block device or partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimNode {
    Blank,
    Table { partitions: usize },
    Fs { fs_type: String, uuid: String },
    Pv { vg: Option<String> },
    Ambivalent,
}

#[derive(Default)]
struct SimState {
    nodes: HashMap<PathBuf, SimNode>,
    calls: Vec<CommandSpec>,
    failing: HashSet<String>,
    missing: HashSet<String>,
    vgs: HashSet<String>,
    next_uuid: u32,
}

pub struct SimHost {
    pub dir: TempDir,
    pub paths: HostPaths,
    state: Mutex<SimState>,
}

impl SimHost {
    pub fn new() -> Arc<Self> {
        let dir = TempDir::new().expect("tempdir");
        let paths = HostPaths {
            sys_root: dir.path().join("sys"),
            proc_root: dir.path().join("proc"),
            mountinfo: dir.path().join("mountinfo"),
            dev_root: dir.path().join("dev"),
        };
        for d in [paths.block_dir(), paths.proc_root.clone(), paths.dev_root.clone()] {
            std::fs::create_dir_all(d).expect("sim dirs");
        }
        std::fs::write(
            &paths.mountinfo,
            "22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/vda1 rw\n",
        )
        .expect("mountinfo");

        Arc::new(Self {
            dir,
            paths,
            state: Mutex::new(SimState::default()),
        })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn readiness() -> Readiness {
        Readiness::new(3, 0)
    }

    /// Pretend the nbd module is loaded with `slots` devices.
    pub fn load_nbd(&self, slots: u32) {
        std::fs::create_dir_all(self.paths.module_dir("nbd")).expect("module dir");
        for i in 0..slots {
            std::fs::create_dir_all(self.paths.block_dir().join(format!("nbd{}", i)))
                .expect("slot dir");
        }
    }

    /// Mark a slot as taken by some other client.
    pub fn occupy_slot(&self, slot: &str) {
        let dir = self.paths.block_dir().join(slot);
        std::fs::create_dir_all(&dir).expect("slot dir");
        std::fs::write(dir.join("pid"), "1\n").expect("pid attr");
        std::fs::write(dir.join("size"), format!("{}\n", SIM_DEVICE_SECTORS)).expect("size attr");
    }

    pub fn release_slot(&self, slot: &str) {
        let _ = std::fs::remove_file(self.paths.block_dir().join(slot).join("pid"));
    }

    /// Create a device node with the given contents.
    pub fn set_node(&self, node: &Path, content: SimNode) {
        std::fs::write(node, b"").expect("device node");
        self.state.lock().nodes.insert(node.to_path_buf(), content);
    }

    pub fn node(&self, node: &Path) -> Option<SimNode> {
        self.state.lock().nodes.get(node).cloned()
    }

    pub fn add_vg(&self, vg: &str) {
        self.state.lock().vgs.insert(vg.to_string());
    }

    pub fn has_vg(&self, vg: &str) -> bool {
        self.state.lock().vgs.contains(vg)
    }

    /// Make every invocation of `program` exit non-zero.
    pub fn fail(&self, program: &str) {
        self.state.lock().failing.insert(program.to_string());
    }

    /// Make `program` unlaunchable, as if it were not installed.
    pub fn uninstall(&self, program: &str) {
        self.state.lock().missing.insert(program.to_string());
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.state.lock().calls.clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Write a mountinfo line, as an external mount would.
    pub fn add_mount(&self, source: &str, target: &Path, fs_type: &str) {
        let mut content = std::fs::read_to_string(&self.paths.mountinfo).unwrap_or_default();
        content.push_str(&format!(
            "90 22 0:99 / {} rw,relatime - {} {} rw\n",
            target.display().to_string().replace(' ', "\\040"),
            fs_type,
            source
        ));
        std::fs::write(&self.paths.mountinfo, content).expect("mountinfo");
    }

    pub fn remove_mount(&self, target: &Path) {
        let escaped = target.display().to_string().replace(' ', "\\040");
        let content = std::fs::read_to_string(&self.paths.mountinfo).unwrap_or_default();
        let kept: String = content
            .lines()
            .filter(|line| line.split_whitespace().nth(4) != Some(escaped.as_str()))
            .map(|line| format!("{}\n", line))
            .collect();
        std::fs::write(&self.paths.mountinfo, kept).expect("mountinfo");
    }

    fn slot_dir(&self, device: &str) -> Option<PathBuf> {
        let name = Path::new(device).file_name()?.to_str()?.to_string();
        Some(self.paths.block_dir().join(name))
    }

    fn simulate(&self, cmd: &CommandSpec, state: &mut SimState) -> CommandOutput {
        let last = cmd.args.last().cloned().unwrap_or_default();
        match cmd.program.as_str() {
            "modprobe" => {
                let slots = cmd
                    .args
                    .iter()
                    .find_map(|a| a.strip_prefix("nbds_max="))
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(16);
                self.load_nbd(slots);
                CommandOutput::ok("")
            }
            "nbd-client" if cmd.has_arg("-d") => {
                if let Some(dir) = self.slot_dir(&last) {
                    let _ = std::fs::remove_file(dir.join("pid"));
                    let _ = std::fs::remove_file(dir.join("size"));
                }
                CommandOutput::ok("")
            }
            "nbd-client" => {
                let device = cmd.args.get(2).cloned().unwrap_or_default();
                let Some(dir) = self.slot_dir(&device) else {
                    return CommandOutput::failed(1, "bad device");
                };
                if dir.join("pid").exists() {
                    return CommandOutput::failed(1, "Device busy");
                }
                std::fs::write(dir.join("pid"), "4000\n").expect("pid attr");
                std::fs::write(dir.join("size"), format!("{}\n", SIM_DEVICE_SECTORS))
                    .expect("size attr");
                let node = PathBuf::from(&device);
                std::fs::write(&node, b"").expect("device node");
                state.nodes.entry(node).or_insert(SimNode::Blank);
                CommandOutput::ok("Negotiation: ..size = 1024MB\n")
            }
            "blkid" if cmd.has_arg("-U") => {
                let uuid = cmd.args.get(1).cloned().unwrap_or_default();
                let found = state.nodes.iter().find_map(|(path, node)| match node {
                    SimNode::Fs { uuid: u, .. } if *u == uuid => Some(path.clone()),
                    _ => None,
                });
                match found {
                    Some(path) => CommandOutput::ok(format!("{}\n", path.display())),
                    None => CommandOutput::failed(2, ""),
                }
            }
            "blkid" => {
                let node = state
                    .nodes
                    .get(Path::new(&last))
                    .cloned()
                    .unwrap_or(SimNode::Blank);
                match node {
                    SimNode::Blank => CommandOutput::failed(2, ""),
                    SimNode::Ambivalent => CommandOutput::failed(8, ""),
                    SimNode::Table { .. } => CommandOutput::ok(format!(
                        "DEVNAME={}\nPTUUID=5e1f2d3c-aaaa-bbbb-cccc-000000000001\nPTTYPE=gpt\n",
                        last
                    )),
                    SimNode::Fs { fs_type, uuid } => CommandOutput::ok(format!(
                        "DEVNAME={}\nUUID={}\nBLOCK_SIZE=4096\nTYPE={}\nUSAGE=filesystem\n",
                        last, uuid, fs_type
                    )),
                    SimNode::Pv { .. } => CommandOutput::ok(format!(
                        "DEVNAME={}\nUUID=Pv0000-0000\nVERSION=LVM2 001\nTYPE=LVM2_member\nUSAGE=raid\n",
                        last
                    )),
                }
            }
            "sfdisk" if cmd.has_arg("--json") => match state.nodes.get(Path::new(&last)) {
                Some(SimNode::Table { partitions }) => {
                    let parts: Vec<String> = (1..=*partitions)
                        .map(|i| {
                            format!(
                                r#"{{"node": "{}p{}", "start": 2048, "size": 2095071, "type": "0FC63DAF-8483-4772-8E79-3D69D8477DE4"}}"#,
                                last, i
                            )
                        })
                        .collect();
                    CommandOutput::ok(format!(
                        r#"{{"partitiontable": {{"label": "gpt", "id": "5E1F2D3C", "device": "{}", "unit": "sectors", "firstlba": 2048, "lastlba": 2097118, "sectorsize": 512, "partitions": [{}]}}}}"#,
                        last,
                        parts.join(",")
                    ))
                }
                _ => CommandOutput::failed(1, "sfdisk: does not contain a recognized partition table"),
            },
            "sfdisk" => {
                let device = PathBuf::from(&last);
                match state.nodes.get(&device) {
                    Some(SimNode::Blank) | None => {
                        state.nodes.insert(device.clone(), SimNode::Table { partitions: 1 });
                        let part = PathBuf::from(format!("{}p1", last));
                        std::fs::write(&part, b"").expect("partition node");
                        state.nodes.insert(part, SimNode::Blank);
                        CommandOutput::ok("")
                    }
                    Some(_) => CommandOutput::failed(1, "device contains data"),
                }
            }
            "udevadm" | "setfacl" | "systemctl" => CommandOutput::ok(""),
            program if program.starts_with("mkfs.") => {
                let fs_type = program.trim_start_matches("mkfs.").to_string();
                state.next_uuid += 1;
                let uuid = format!("0f0e0d0c-0000-4000-8000-{:012x}", state.next_uuid);
                state
                    .nodes
                    .insert(PathBuf::from(&last), SimNode::Fs { fs_type, uuid });
                CommandOutput::ok("")
            }
            "pvs" => match state.nodes.get(Path::new(&last)) {
                Some(SimNode::Pv { vg }) => {
                    CommandOutput::ok(format!("  {}\n", vg.clone().unwrap_or_default()))
                }
                _ => CommandOutput::failed(5, "Failed to find physical volume"),
            },
            "vgs" => {
                if state.vgs.contains(&last) {
                    CommandOutput::ok(format!("  {}\n", last))
                } else {
                    CommandOutput::failed(5, "Volume group not found")
                }
            }
            "pvcreate" => {
                state
                    .nodes
                    .insert(PathBuf::from(&last), SimNode::Pv { vg: None });
                CommandOutput::ok("")
            }
            "pvremove" => {
                state.nodes.insert(PathBuf::from(&last), SimNode::Blank);
                CommandOutput::ok("")
            }
            "vgcreate" | "vgextend" => {
                let vg = cmd.args.first().cloned().unwrap_or_default();
                state.vgs.insert(vg.clone());
                state
                    .nodes
                    .insert(PathBuf::from(&last), SimNode::Pv { vg: Some(vg) });
                CommandOutput::ok("")
            }
            "vgchange" => {
                if state.vgs.contains(&last) {
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(5, "Volume group not found")
                }
            }
            other => CommandOutput::failed(127, format!("{}: not simulated", other)),
        }
    }
}

impl CommandRunner for SimHost {
    fn run(&self, cmd: &CommandSpec) -> std::io::Result<CommandOutput> {
        let mut state = self.state.lock();
        state.calls.push(cmd.clone());
        if state.missing.contains(&cmd.program) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{}: not installed", cmd.program),
            ));
        }
        if state.failing.contains(&cmd.program) {
            return Ok(CommandOutput::failed(1, format!("{}: simulated failure", cmd.program)));
        }
        Ok(self.simulate(cmd, &mut state))
    }
}

/// In-memory export server.
#[derive(Default)]
pub struct FakeServer {
    serving: Mutex<HashMap<PathBuf, u32>>,
    foreign: Mutex<Vec<(PathBuf, ServerProcess)>>,
    starts: Mutex<u32>,
    fail_start: Mutex<bool>,
    start_delay: Option<Duration>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            start_delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn starts(&self) -> u32 {
        *self.starts.lock()
    }

    pub fn set_fail_start(&self, fail: bool) {
        *self.fail_start.lock() = fail;
    }

    /// Simulate the server dying.
    pub fn crash(&self, endpoint: &Endpoint) {
        self.serving.lock().remove(&endpoint.socket);
    }

    /// Register a server this crate did not start.
    pub fn add_foreign(&self, image: &Path, pid: u32, socket: Option<PathBuf>) {
        self.foreign
            .lock()
            .push((image.to_path_buf(), ServerProcess { pid, socket }));
    }
}

impl ExportServer for FakeServer {
    fn start(&self, _image: &DiskImage, endpoint: &Endpoint, pid_file: &Path) -> DiskResult<u32> {
        if let Some(delay) = self.start_delay {
            std::thread::sleep(delay);
        }
        if *self.fail_start.lock() {
            return Err(DiskError::ExportUnavailable("qemu-nbd exited with 1".into()));
        }
        let mut starts = self.starts.lock();
        *starts += 1;
        let pid = 5000 + *starts;
        std::fs::write(pid_file, format!("{}\n", pid))?;
        self.serving.lock().insert(endpoint.socket.clone(), pid);
        Ok(pid)
    }

    fn is_serving(&self, pid: u32, endpoint: &Endpoint) -> bool {
        self.serving.lock().get(&endpoint.socket) == Some(&pid)
    }

    fn servers_for(&self, image: &Path) -> Vec<ServerProcess> {
        self.foreign
            .lock()
            .iter()
            .filter(|(path, _)| path == image)
            .map(|(_, server)| server.clone())
            .collect()
    }

    fn stop(&self, pid: u32) -> DiskResult<()> {
        self.serving.lock().retain(|_, p| *p != pid);
        Ok(())
    }
}

/// Mounter that only edits the simulated mount table.
pub struct FakeMounter {
    host: Arc<SimHost>,
}

impl FakeMounter {
    pub fn new(host: Arc<SimHost>) -> Arc<Self> {
        Arc::new(Self { host })
    }
}

impl Mounter for FakeMounter {
    fn mount(&self, source: &Path, target: &Path, fs_type: &str) -> DiskResult<()> {
        self.host
            .add_mount(&source.display().to_string(), target, fs_type);
        Ok(())
    }

    fn unmount(&self, target: &Path) -> DiskResult<()> {
        self.host.remove_mount(target);
        Ok(())
    }
}

/// Owner names of the current process, so chown succeeds unprivileged.
pub fn current_owner() -> crate::mount::Owner {
    let user = nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .expect("current user has a passwd entry");
    let group = nix::unistd::Group::from_gid(nix::unistd::getgid())
        .ok()
        .flatten()
        .map(|g| g.name)
        .expect("current group has a group entry");
    crate::mount::Owner::new(user, group)
}

/// A small raw image file inside the sim root.
pub fn sim_image(host: &SimHost, name: &str) -> PathBuf {
    let path = host.root().join(name);
    std::fs::write(&path, vec![0u8; 4096]).expect("image");
    path
}
