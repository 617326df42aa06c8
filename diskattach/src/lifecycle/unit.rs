//! systemd boot unit.
//!
//! The unit is a plain data record rendered from a [`BootSequence`]; the
//! [`UnitInstaller`] hands it to systemd. Nothing else is persisted.

use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use diskattach_shared::errors::{DiskError, DiskResult};
use tempfile::NamedTempFile;

use super::BootSequence;
use crate::constants::systemd::{START_TIMEOUT_SECS, WANTED_BY};
use crate::util::{CommandRunner, CommandSpec};

const AFTER: &[&str] = &[
    "local-fs.target",
    "network-online.target",
    "systemd-modules-load.service",
];
const WANTS: &[&str] = &["network-online.target", "systemd-modules-load.service"];

/// A oneshot service that replays the boot sequence and stays active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootUnit {
    pub description: String,
    pub exec_start: Vec<String>,
    pub exec_stop: Vec<String>,
}

impl BootUnit {
    /// Unit running `<program> up ...` at start and `<program> down ...` at
    /// stop, with the sequence spelled out as flags so the unit does not
    /// depend on ambient configuration beyond `config`.
    pub fn for_sequence(program: &Path, sequence: &BootSequence, config: Option<&Path>) -> Self {
        let mut common = Vec::new();
        if let Some(config) = config {
            common.push("--config".to_string());
            common.push(config.display().to_string());
        }

        let mut flags = vec![
            "--image".to_string(),
            sequence.image.display().to_string(),
            "--mount-point".to_string(),
            sequence.mount_point.display().to_string(),
        ];
        let mut up_flags = flags.clone();
        up_flags.extend([
            "--fs-type".to_string(),
            sequence.fs_type.to_string(),
            "--user".to_string(),
            sequence.owner.user.clone(),
            "--group".to_string(),
            sequence.owner.group.clone(),
        ]);
        if let Some(vg) = &sequence.volume_group {
            up_flags.extend(["--volume-group".to_string(), vg.clone()]);
        }

        let program = program.display().to_string();
        let mut exec_start = vec![program.clone()];
        exec_start.extend(common.iter().cloned());
        exec_start.push("up".to_string());
        exec_start.append(&mut up_flags);

        let mut exec_stop = vec![program];
        exec_stop.extend(common);
        exec_stop.push("down".to_string());
        exec_stop.append(&mut flags);

        Self {
            description: format!(
                "Attach {} and mount it at {}",
                sequence.image.display(),
                sequence.mount_point.display()
            ),
            exec_start,
            exec_stop,
        }
    }

    pub fn render(&self) -> String {
        format!(
            "[Unit]\n\
             Description={description}\n\
             Documentation=man:qemu-nbd(8) man:nbd-client(8)\n\
             After={after}\n\
             Wants={wants}\n\
             \n\
             [Service]\n\
             Type=oneshot\n\
             RemainAfterExit=yes\n\
             ExecStart={exec_start}\n\
             ExecStop={exec_stop}\n\
             TimeoutStartSec={timeout}\n\
             \n\
             [Install]\n\
             WantedBy={wanted_by}\n",
            description = escape_specifiers(&self.description),
            after = AFTER.join(" "),
            wants = WANTS.join(" "),
            exec_start = command_line(&self.exec_start),
            exec_stop = command_line(&self.exec_stop),
            timeout = START_TIMEOUT_SECS,
            wanted_by = WANTED_BY,
        )
    }
}

fn command_line(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| quote_arg(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quote one argument for an `Exec*=` line.
fn quote_arg(arg: &str) -> String {
    let escaped = escape_specifiers(arg).replace('$', "$$");
    let needs_quotes = escaped.is_empty()
        || escaped
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | ';'));
    if needs_quotes {
        format!(
            "\"{}\"",
            escaped.replace('\\', "\\\\").replace('"', "\\\"")
        )
    } else {
        escaped
    }
}

fn escape_specifiers(s: &str) -> String {
    s.replace('%', "%%")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    Unchanged,
}

/// Writes unit files and registers them with systemd.
pub struct UnitInstaller {
    runner: Arc<dyn CommandRunner>,
    unit_dir: PathBuf,
    unit_name: String,
}

impl UnitInstaller {
    pub fn new(runner: Arc<dyn CommandRunner>, unit_dir: PathBuf, unit_name: String) -> Self {
        Self {
            runner,
            unit_dir,
            unit_name,
        }
    }

    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(&self.unit_name)
    }

    /// Install and enable `unit`. Identical content on disk is left alone.
    pub fn install(&self, unit: &BootUnit) -> DiskResult<InstallOutcome> {
        let path = self.unit_path();
        let content = unit.render();

        let unchanged = std::fs::read_to_string(&path).is_ok_and(|current| current == content);
        if unchanged {
            if !self.is_enabled()? {
                self.systemctl(&["enable", self.unit_name.as_str()])?;
            }
            tracing::debug!(unit = %path.display(), "Boot unit already installed");
            return Ok(InstallOutcome::Unchanged);
        }

        std::fs::create_dir_all(&self.unit_dir).map_err(|e| {
            DiskError::Storage(format!(
                "Failed to create unit directory {}: {}",
                self.unit_dir.display(),
                e
            ))
        })?;
        let mut file = NamedTempFile::new_in(&self.unit_dir)?;
        file.write_all(content.as_bytes())?;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
        file.as_file().sync_all()?;
        file.persist(&path).map_err(|e| {
            DiskError::Storage(format!("Failed to write {}: {}", path.display(), e.error))
        })?;

        self.systemctl(&["daemon-reload"])?;
        self.systemctl(&["enable", self.unit_name.as_str()])?;
        tracing::info!(unit = %path.display(), "Boot unit installed and enabled");
        Ok(InstallOutcome::Installed)
    }

    /// Start the unit now.
    pub fn start(&self) -> DiskResult<()> {
        self.systemctl(&["start", self.unit_name.as_str()])
    }

    fn is_enabled(&self) -> DiskResult<bool> {
        let output = self
            .runner
            .run(&CommandSpec::new("systemctl").args(["is-enabled", "--quiet", self.unit_name.as_str()]))
            .map_err(|e| DiskError::Storage(format!("Failed to launch systemctl: {}", e)))?;
        Ok(output.success())
    }

    fn systemctl(&self, args: &[&str]) -> DiskResult<()> {
        let cmd = CommandSpec::new("systemctl").args(args.iter().copied());
        let output = self
            .runner
            .run(&cmd)
            .map_err(|e| DiskError::Storage(format!("Failed to launch systemctl: {}", e)))?;
        if !output.success() {
            return Err(DiskError::Storage(format!(
                "{} failed: {}",
                cmd,
                output.diagnostic()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::Owner;
    use crate::testing::SimHost;
    use crate::volume::FsType;

    fn sequence() -> BootSequence {
        BootSequence {
            image: PathBuf::from("/android.qcow2"),
            mount_point: PathBuf::from("/mnt/my data"),
            fs_type: FsType::Ext4,
            owner: Owner::new("droid", "users"),
            volume_group: None,
        }
    }

    #[test]
    fn test_render_declares_oneshot_and_ordering() {
        let unit = BootUnit::for_sequence(Path::new("/usr/local/bin/diskattach"), &sequence(), None);
        let text = unit.render();

        assert!(text.contains("Type=oneshot\n"));
        assert!(text.contains("RemainAfterExit=yes\n"));
        assert!(text.contains(
            "After=local-fs.target network-online.target systemd-modules-load.service\n"
        ));
        assert!(text.contains("WantedBy=multi-user.target\n"));
        assert!(text.contains(
            "ExecStart=/usr/local/bin/diskattach up --image /android.qcow2 --mount-point \"/mnt/my data\" --fs-type ext4 --user droid --group users\n"
        ));
        assert!(text.contains(
            "ExecStop=/usr/local/bin/diskattach down --image /android.qcow2 --mount-point \"/mnt/my data\"\n"
        ));
    }

    #[test]
    fn test_config_and_volume_group_flags() {
        let mut seq = sequence();
        seq.volume_group = Some("data_vg".into());
        let unit = BootUnit::for_sequence(
            Path::new("/usr/bin/diskattach"),
            &seq,
            Some(Path::new("/etc/diskattach.json")),
        );
        assert_eq!(
            &unit.exec_start[..4],
            ["/usr/bin/diskattach", "--config", "/etc/diskattach.json", "up"]
        );
        assert!(unit.exec_start.ends_with(&["--volume-group".to_string(), "data_vg".to_string()]));
        assert!(!unit.exec_stop.contains(&"--volume-group".to_string()));
    }

    #[test]
    fn test_quote_arg() {
        assert_eq!(quote_arg("plain"), "plain");
        assert_eq!(quote_arg("100%"), "100%%");
        assert_eq!(quote_arg("$HOME"), "$$HOME");
        assert_eq!(quote_arg("a \"b\""), "\"a \\\"b\\\"\"");
        assert_eq!(quote_arg(""), "\"\"");
    }

    #[test]
    fn test_install_is_idempotent() {
        let host = SimHost::new();
        let installer = UnitInstaller::new(
            host.clone(),
            host.root().join("systemd"),
            "diskattach-data.service".into(),
        );
        let unit = BootUnit::for_sequence(Path::new("/usr/bin/diskattach"), &sequence(), None);

        assert_eq!(installer.install(&unit).unwrap(), InstallOutcome::Installed);
        let written = std::fs::read_to_string(installer.unit_path()).unwrap();
        assert_eq!(written, unit.render());
        let mode = std::fs::metadata(installer.unit_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);

        let calls: Vec<Vec<String>> = host
            .calls_to("systemctl")
            .into_iter()
            .map(|c| c.args)
            .collect();
        assert_eq!(
            calls,
            vec![
                vec!["daemon-reload".to_string()],
                vec!["enable".to_string(), "diskattach-data.service".to_string()],
            ]
        );

        host.clear_calls();
        assert_eq!(installer.install(&unit).unwrap(), InstallOutcome::Unchanged);
        let calls = host.calls_to("systemctl");
        assert_eq!(calls.len(), 1);
        assert!(calls[0].has_arg("is-enabled"));
    }

    #[test]
    fn test_changed_sequence_rewrites_unit() {
        let host = SimHost::new();
        let installer = UnitInstaller::new(
            host.clone(),
            host.root().join("systemd"),
            "diskattach-data.service".into(),
        );
        let first = BootUnit::for_sequence(Path::new("/usr/bin/diskattach"), &sequence(), None);
        installer.install(&first).unwrap();

        let mut seq = sequence();
        seq.fs_type = FsType::Xfs;
        let second = BootUnit::for_sequence(Path::new("/usr/bin/diskattach"), &seq, None);
        assert_eq!(installer.install(&second).unwrap(), InstallOutcome::Installed);
        assert!(
            std::fs::read_to_string(installer.unit_path())
                .unwrap()
                .contains("--fs-type xfs")
        );
    }
}
