//! The remote command adapter: what to run on a host and how to read the
//! answers back.
//!
//! Commands differ between GNU and BSD userlands, so every builder takes
//! the probed [`OsFamily`]. Stat output uses a fixed bracket-delimited
//! format so one parser covers both dialects, and command failures are
//! classified into structured kinds here, at the adapter layer, so the
//! state machine never sniffs error prose itself.

use std::sync::LazyLock;

use regex::Regex;

use crate::perms::symbolic_to_numeric;
use crate::types::{DeployError, RemoteFileInfo, RemoteFsType};

/// Remote OS family, as classified from `uname` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Linux,
    Bsd,
    Unknown,
}

impl OsFamily {
    /// Classify a `uname` response.
    pub fn classify(uname_output: &str) -> Self {
        let s = uname_output.trim().to_ascii_lowercase();
        match s.as_str() {
            "linux" => OsFamily::Linux,
            "freebsd" | "openbsd" | "netbsd" | "dragonfly" | "darwin" => OsFamily::Bsd,
            _ => OsFamily::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Linux => "linux",
            OsFamily::Bsd => "bsd",
            OsFamily::Unknown => "unknown",
        }
    }
}

/// How a failed remote command should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// The path already exists (idempotent mkdir and friends).
    AlreadyExists,
    /// The path does not exist (tolerated for deletes and probes).
    NotFound,
    Other,
}

/// Classify a failed command's stderr once, here, into a structured kind.
pub fn classify_stderr(stderr: &str) -> RemoteErrorKind {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("file exists") {
        RemoteErrorKind::AlreadyExists
    } else if lower.contains("no such file or directory") {
        RemoteErrorKind::NotFound
    } else {
        RemoteErrorKind::Other
    }
}

/// Single-quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// The `uname` OS probe.
pub fn uname_command() -> String {
    "uname".to_string()
}

/// Stat one path in the bracket format
/// `[name],[type],[user],[group],[perms],[size],[deref]`.
pub fn stat_command(os: OsFamily, path: &str) -> String {
    let quoted = shell_quote(path);
    match os {
        OsFamily::Linux => format!(
            "stat --printf '[%n],[%F],[%U],[%G],[%A],[%s],[%N]' -- {quoted}"
        ),
        // %Y is the symlink target, empty for everything else.
        _ => format!("stat -f '[%N],[%HT],[%Su],[%Sg],[%Sp],[%z],[%Y]' {quoted}"),
    }
}

/// Hash a regular file; output contains a 64-hex digest.
pub fn hash_command(os: OsFamily, path: &str) -> String {
    let quoted = shell_quote(path);
    match os {
        OsFamily::Linux => format!("sha256sum -- {quoted}"),
        _ => format!("sha256 -q {quoted}"),
    }
}

pub fn mkdir_command(path: &str) -> String {
    format!("mkdir {}", shell_quote(path))
}

pub fn mkdir_parents_command(path: &str) -> String {
    format!("mkdir -p {}", shell_quote(path))
}

pub fn chmod_command(permissions: u32, path: &str) -> String {
    format!("chmod {permissions} {}", shell_quote(path))
}

pub fn chown_command(owner_group: &str, path: &str) -> String {
    format!("chown {} {}", shell_quote(owner_group), shell_quote(path))
}

pub fn remove_command(path: &str) -> String {
    format!("rm {}", shell_quote(path))
}

pub fn remove_empty_dir_command(path: &str) -> String {
    format!("rmdir {}", shell_quote(path))
}

/// Atomic move into place (same filesystem when buffer placement allows).
pub fn move_command(from: &str, to: &str) -> String {
    format!("mv -f {} {}", shell_quote(from), shell_quote(to))
}

pub fn copy_command(from: &str, to: &str) -> String {
    format!("cp -p {} {}", shell_quote(from), shell_quote(to))
}

/// Create or replace a symlink without dereferencing an existing one.
pub fn symlink_command(target: &str, link: &str) -> String {
    format!("ln -sfn {} {}", shell_quote(target), shell_quote(link))
}

/// Receive stdin into a staging path.
pub fn receive_command(path: &str) -> String {
    format!("cat > {}", shell_quote(path))
}

pub fn remove_tree_command(path: &str) -> String {
    format!("rm -rf {}", shell_quote(path))
}

static STAT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\[(?P<name>.*?)\],\[(?P<ty>[^\]]*)\],\[(?P<user>[^\]]*)\],\[(?P<group>[^\]]*)\],\[(?P<perms>[^\]]*)\],\[(?P<size>[0-9]*)\],\[(?P<deref>.*)\]$",
    )
    .expect("stat pattern compiles")
});

static SHA256_HEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9a-f]{64}").expect("hash pattern compiles"));

/// Extract the first lower-case 64-hex digest from hash command output.
pub fn find_sha256(output: &str) -> Option<String> {
    SHA256_HEX.find(output).map(|m| m.as_str().to_string())
}

/// Parse bracket-format stat output into a [`RemoteFileInfo`].
pub fn parse_stat_output(output: &str) -> Result<RemoteFileInfo, DeployError> {
    let line = output.trim();
    let caps = STAT_LINE.captures(line).ok_or_else(|| {
        DeployError::Conflict(format!("unparsable stat output: {line:?}"))
    })?;

    let fs_type = parse_fs_type(&caps["ty"]);
    let permissions = symbolic_to_numeric(&caps["perms"]).unwrap_or(0);
    let size = caps["size"].parse::<u64>().unwrap_or(0);
    let link_target = parse_deref(&caps["deref"]);

    Ok(RemoteFileInfo {
        name: caps["name"].to_string(),
        fs_type,
        owner: caps["user"].to_string(),
        group: caps["group"].to_string(),
        permissions,
        size,
        link_target,
        hash: None,
        exists: true,
    })
}

fn parse_fs_type(raw: &str) -> RemoteFsType {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("directory") {
        RemoteFsType::Directory
    } else if lower.contains("symbolic link") {
        RemoteFsType::Symlink
    } else if lower.contains("regular") {
        RemoteFsType::Regular
    } else {
        RemoteFsType::Other(raw.to_string())
    }
}

/// The deref field is either `'name' -> 'target'` (GNU `%N`), a bare
/// target (BSD `%Y`), or the empty sentinel.
fn parse_deref(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some((_, target)) = raw.split_once(" -> ") {
        return Some(target.trim_matches('\'').to_string());
    }
    if raw.starts_with('\'') && raw.ends_with('\'') {
        // GNU quotes the name alone for non-links.
        return None;
    }
    Some(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_uname_output() {
        assert_eq!(OsFamily::classify("Linux\n"), OsFamily::Linux);
        assert_eq!(OsFamily::classify("FreeBSD"), OsFamily::Bsd);
        assert_eq!(OsFamily::classify("Darwin"), OsFamily::Bsd);
        assert_eq!(OsFamily::classify("SunOS"), OsFamily::Unknown);
    }

    #[test]
    fn classify_stderr_kinds() {
        assert_eq!(
            classify_stderr("mkdir: cannot create directory '/x': File exists"),
            RemoteErrorKind::AlreadyExists
        );
        assert_eq!(
            classify_stderr("rm: cannot remove '/x': No such file or directory"),
            RemoteErrorKind::NotFound
        );
        assert_eq!(classify_stderr("permission denied"), RemoteErrorKind::Other);
    }

    #[test]
    fn shell_quote_wraps_and_escapes() {
        assert_eq!(shell_quote("/etc/app.conf"), "'/etc/app.conf'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn stat_commands_pick_the_dialect() {
        assert!(stat_command(OsFamily::Linux, "/etc/x").starts_with("stat --printf"));
        assert!(stat_command(OsFamily::Bsd, "/etc/x").starts_with("stat -f"));
        assert!(hash_command(OsFamily::Linux, "/etc/x").starts_with("sha256sum"));
        assert!(hash_command(OsFamily::Bsd, "/etc/x").starts_with("sha256 -q"));
    }

    #[test]
    fn parse_gnu_regular_file_stat() {
        let out = "[/etc/hello.conf],[regular file],[root],[root],[-rw-r--r--],[3],['/etc/hello.conf']";
        let info = parse_stat_output(out).expect("parse");
        assert_eq!(info.name, "/etc/hello.conf");
        assert_eq!(info.fs_type, RemoteFsType::Regular);
        assert_eq!(info.owner, "root");
        assert_eq!(info.permissions, 644);
        assert_eq!(info.size, 3);
        assert_eq!(info.link_target, None);
        assert!(info.exists);
    }

    #[test]
    fn parse_gnu_symlink_stat() {
        let out = "[/etc/link],[symbolic link],[root],[wheel],[lrwxrwxrwx],[9],['/etc/link' -> '/etc/real']";
        let info = parse_stat_output(out).expect("parse");
        assert_eq!(info.fs_type, RemoteFsType::Symlink);
        assert_eq!(info.link_target.as_deref(), Some("/etc/real"));
        assert_eq!(info.permissions, 777);
    }

    #[test]
    fn parse_bsd_stat_with_empty_deref() {
        let out = "[/etc/rc.conf],[Regular File],[root],[wheel],[-rw-r--r--],[512],[]";
        let info = parse_stat_output(out).expect("parse");
        assert_eq!(info.fs_type, RemoteFsType::Regular);
        assert_eq!(info.group, "wheel");
        assert_eq!(info.link_target, None);
    }

    #[test]
    fn parse_bsd_symlink_deref() {
        let out = "[/etc/link],[Symbolic Link],[root],[wheel],[lrwxr-xr-x],[9],[/etc/real]";
        let info = parse_stat_output(out).expect("parse");
        assert_eq!(info.link_target.as_deref(), Some("/etc/real"));
    }

    #[test]
    fn parse_directory_stat() {
        let out = "[/etc/app],[directory],[app],[app],[drwxr-x---],[4096],['/etc/app']";
        let info = parse_stat_output(out).expect("parse");
        assert_eq!(info.fs_type, RemoteFsType::Directory);
        assert_eq!(info.permissions, 750);
    }

    #[test]
    fn garbage_stat_output_is_a_conflict() {
        let err = parse_stat_output("stat: illegal option").expect_err("must fail");
        assert!(matches!(err, DeployError::Conflict(_)));
    }

    #[test]
    fn find_sha256_extracts_from_tool_output() {
        let digest = "a".repeat(64);
        let linux = format!("{digest}  /etc/hello.conf\n");
        assert_eq!(find_sha256(&linux).as_deref(), Some(digest.as_str()));
        let bsd = format!("{digest}\n");
        assert_eq!(find_sha256(&bsd).as_deref(), Some(digest.as_str()));
        assert_eq!(find_sha256("not a digest"), None);
    }

    #[test]
    fn commands_quote_their_paths() {
        assert_eq!(remove_command("/etc/a b"), "rm '/etc/a b'");
        assert_eq!(
            move_command("/tmp/buf", "/etc/a.conf"),
            "mv -f '/tmp/buf' '/etc/a.conf'"
        );
        assert_eq!(
            symlink_command("/etc/real", "/etc/link"),
            "ln -sfn '/etc/real' '/etc/link'"
        );
        assert_eq!(receive_command("/tmp/buf"), "cat > '/tmp/buf'");
    }
}
