//! Stub `btrfs`, `ssh` and `age` programs for tests.
//!
//! Each [`StubEnv`] owns a temp directory with POSIX shell stubs, a directory
//! standing in for the remote backup host, and per-tool invocation logs.
//! Failure modes are switched on with marker files ([`StubEnv::set_flag`]), so
//! tests never touch the process environment and can run in parallel.
//!
//! - `btrfs send <dir>` emits `<dir>/payload`; `btrfs send -p <parent> <dir>`
//!   emits `<dir>/delta`. Plain files are emitted as-is.
//! - `btrfs subvolume snapshot -r <src> <dest>` copies `src` to `dest`.
//! - `ssh ... <cmd>` runs `<cmd>` locally with `sh -c`.
//! - `age -r <recipient>` prefixes the stream with `age-prefix:`.
//!
//! Flags: `fail-send`, `fail-snapshot`, `fail-delete`, `fail-list` (btrfs);
//! `fail-ssh`, `fail-ls`, `fail-upload`, `corrupt-upload` (ssh, the latter
//! rewrites every `X` to `Z` on the way into the remote file); `fail-age`.

use crate::config::{Config, LogConfig, ToolsConfig, Volume};
use crate::remote::RemoteShell;
use crate::utils::process::Tool;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const BTRFS_STUB: &str = r#"#!/bin/sh
stub='@ROOT@'
printf '%s\n' "$*" >> "$stub/btrfs.log"
case "$1" in
send)
    shift
    if [ -e "$stub/flags/fail-send" ]; then
        echo "ERROR: send failed" >&2
        exit 1
    fi
    if [ "$1" = "-p" ]; then
        new="$3"
        if [ -d "$new" ]; then cat "$new/delta"; else cat "$new"; fi
    else
        new="$1"
        if [ -d "$new" ]; then cat "$new/payload"; else cat "$new"; fi
    fi
    exit $?
    ;;
subvolume)
    case "$2" in
    snapshot)
        if [ -e "$stub/flags/fail-snapshot" ]; then
            echo "ERROR: cannot snapshot" >&2
            exit 1
        fi
        if [ "$3" = "-r" ]; then src="$4"; dest="$5"; else src="$3"; dest="$4"; fi
        rm -rf "$dest"
        mkdir -p "$(dirname "$dest")"
        cp -R "$src" "$dest"
        exit $?
        ;;
    delete)
        if [ -e "$stub/flags/fail-delete" ]; then
            echo "ERROR: cannot delete" >&2
            exit 1
        fi
        rm -rf "$3"
        exit 0
        ;;
    list)
        if [ -e "$stub/flags/fail-list" ]; then
            echo "ERROR: not a btrfs filesystem" >&2
            exit 1
        fi
        exit 0
        ;;
    esac
    ;;
esac
echo "unexpected btrfs invocation: $*" >&2
exit 1
"#;

const SSH_STUB: &str = r#"#!/bin/sh
stub='@ROOT@'
for last; do :; done
printf '%s\n' "$last" >> "$stub/ssh.log"
if [ -e "$stub/flags/fail-ssh" ]; then
    echo "ssh: connect to host remote port 22: Connection refused" >&2
    exit 255
fi
case "$last" in
"cd "*)
    if [ -e "$stub/flags/fail-ls" ]; then
        echo "ls: cannot open directory: Permission denied" >&2
        exit 2
    fi
    ;;
"tee "*)
    if [ -e "$stub/flags/fail-upload" ]; then
        sh -c "$last" > /dev/null
        echo "tee: write error: No space left on device" >&2
        exit 1
    fi
    if [ -e "$stub/flags/corrupt-upload" ]; then
        tr 'X' 'Z' | sh -c "$last"
        exit $?
    fi
    ;;
esac
exec sh -c "$last"
"#;

const AGE_STUB: &str = r#"#!/bin/sh
stub='@ROOT@'
printf 'age %s\n' "$*" >> "$stub/age.log"
if [ -e "$stub/flags/fail-age" ]; then
    cat > /dev/null
    echo "age: error: malformed recipient" >&2
    exit 1
fi
printf 'age-prefix:'
exec cat
"#;

pub struct StubEnv {
    root: TempDir,
}

impl StubEnv {
    pub fn new() -> Self {
        let root = TempDir::new().expect("create stub dir");
        for dir in ["bin", "flags", "remote"] {
            fs::create_dir_all(root.path().join(dir)).expect("create stub subdir");
        }

        let root_str = root.path().display().to_string();
        for (name, script) in [("btrfs", BTRFS_STUB), ("ssh", SSH_STUB), ("age", AGE_STUB)] {
            fs::write(
                root.path().join("bin").join(name),
                script.replace("@ROOT@", &root_str),
            )
            .expect("write stub script");
        }

        Self { root }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Directory standing in for the remote backup destination.
    pub fn remote_dir(&self) -> PathBuf {
        self.root.path().join("remote")
    }

    pub fn set_flag(&self, flag: &str) {
        fs::write(self.root.path().join("flags").join(flag), b"").expect("write flag");
    }

    /// A one-off tool running `body` as a shell script, for stages whose
    /// behavior the standard stubs do not cover.
    pub fn script_tool(&self, name: &str, body: &str) -> Tool {
        let path = self.root.path().join("bin").join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script tool");
        Tool::parse(&format!("sh {}", path.display())).expect("script tool")
    }

    /// Everything a stub has logged so far (`btrfs`, `ssh` or `age`).
    pub fn log(&self, tool: &str) -> String {
        fs::read_to_string(self.root.path().join(format!("{tool}.log"))).unwrap_or_default()
    }

    fn command_line(&self, tool: &str) -> String {
        format!("sh {}", self.root.path().join("bin").join(tool).display())
    }

    pub fn btrfs_tool(&self) -> Tool {
        Tool::parse(&self.command_line("btrfs")).expect("stub tool")
    }

    pub fn ssh_tool(&self) -> Tool {
        Tool::parse(&self.command_line("ssh")).expect("stub tool")
    }

    pub fn age_tool(&self) -> Tool {
        Tool::parse(&self.command_line("age")).expect("stub tool")
    }

    pub fn remote_shell(&self) -> RemoteShell {
        RemoteShell::new(
            self.ssh_tool(),
            "remote",
            self.remote_dir().display().to_string(),
        )
    }

    /// Names of the files currently in the remote directory, sorted.
    pub fn remote_files(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.remote_dir())
            .expect("read remote dir")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    pub fn touch_remote(&self, name: &str) {
        fs::write(self.remote_dir().join(name), b"data").expect("write remote file");
    }

    /// A source volume directory seeded with `payload`.
    pub fn source_volume(&self, name: &str, payload: &[u8]) -> PathBuf {
        let src = self.root.path().join("volumes").join(name);
        fs::create_dir_all(&src).expect("create source volume");
        fs::write(src.join("payload"), payload).expect("write payload");
        src
    }

    pub fn volume(&self, name: &str, payload: &[u8]) -> Volume {
        Volume {
            name: name.to_string(),
            src: self.source_volume(name, payload),
            snap_dir: self.root.path().join("snapshots").join(name),
        }
    }

    /// A configuration wired to the stubs.
    pub fn config(&self, volumes: Vec<Volume>) -> Config {
        Config {
            ssh_key: None,
            remote_host: "remote".to_string(),
            remote_dest: self.remote_dir().display().to_string(),
            ssh_options: Vec::new(),
            max_age_days: 7,
            max_incrementals: 0,
            encryption_key: None,
            keep_chains: 1,
            snapshot_prefix: "btrfs-backup".to_string(),
            lock_file: self.root.path().join("btrfs-backup.lock"),
            tools: ToolsConfig {
                btrfs: self.command_line("btrfs"),
                ssh: self.command_line("ssh"),
                age: self.command_line("age"),
            },
            log: LogConfig::default(),
            volumes,
        }
    }
}
