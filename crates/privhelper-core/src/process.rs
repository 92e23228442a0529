//! Process identity beyond the pid.
//!
//! A pid is recycled as soon as its process is reaped, and the counter
//! starts over on every boot. Anything that signals or trusts a process by
//! pid later than the moment it learned that pid goes through a
//! [`ProcessStamp`]: pid plus kernel start time (field 22 of
//! `/proc/<pid>/stat`) plus the boot id. A stamp that no longer matches the
//! live process means the pid now names someone else.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Default procfs mount.
pub const PROC_ROOT: &str = "/proc";

/// Fields of `/proc/<pid>/stat` this crate cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    /// Single-letter scheduler state (`R`, `S`, `Z`, ...).
    pub state: char,
    /// Start time in clock ticks since boot.
    pub start_time: u64,
}

impl ProcStat {
    /// Parse the contents of a `stat` file.
    ///
    /// `comm` sits in parentheses and may itself contain spaces and
    /// parentheses, so fields are counted from the last `)`.
    #[must_use]
    pub fn parse(contents: &str) -> Option<Self> {
        let after_comm = contents.rsplit_once(')')?.1;
        let fields: Vec<&str> = after_comm.split_whitespace().collect();
        // fields[0] is field 3 (state); field 22 (starttime) is fields[19].
        let state = fields.first()?.chars().next()?;
        let start_time = fields.get(19)?.parse().ok()?;
        Some(Self { state, start_time })
    }

    /// Read `<proc_root>/<pid>/stat`. `None` once the process is gone.
    #[must_use]
    pub fn read(proc_root: &Path, pid: u32) -> Option<Self> {
        let path = proc_root.join(pid.to_string()).join("stat");
        Self::parse(&std::fs::read_to_string(path).ok()?)
    }

    /// Exited but not yet reaped.
    #[must_use]
    pub const fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X')
    }
}

/// Start time of `pid` from the default procfs.
#[must_use]
pub fn start_time(pid: u32) -> Option<u64> {
    ProcStat::read(Path::new(PROC_ROOT), pid).map(|stat| stat.start_time)
}

/// Current boot id, if the kernel exposes one.
#[must_use]
pub fn boot_id() -> Option<String> {
    std::fs::read_to_string(Path::new(PROC_ROOT).join("sys/kernel/random/boot_id"))
        .ok()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

/// A pid pinned to one particular process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStamp {
    /// Process id.
    pub pid: u32,
    /// Kernel start time at the moment the stamp was taken.
    pub start_time: u64,
    /// Boot the process was seen in; `-` on disk when unknown.
    pub boot_id: Option<String>,
}

impl ProcessStamp {
    /// Stamp the process currently running as `pid`.
    #[must_use]
    pub fn capture(pid: u32) -> Option<Self> {
        Some(Self {
            pid,
            start_time: start_time(pid)?,
            boot_id: boot_id(),
        })
    }

    /// Returns `true` if `pid` still names the stamped process and it has
    /// not exited.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.matches(Path::new(PROC_ROOT), boot_id().as_deref())
    }

    fn matches(&self, proc_root: &Path, current_boot: Option<&str>) -> bool {
        if self.boot_id.as_deref() != current_boot {
            return false;
        }
        ProcStat::read(proc_root, self.pid)
            .is_some_and(|stat| stat.start_time == self.start_time && !stat.is_zombie())
    }
}

impl fmt::Display for ProcessStamp {
    /// Pid file form: `<pid> <start_time> <boot_id or ->`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.pid,
            self.start_time,
            self.boot_id.as_deref().unwrap_or("-")
        )
    }
}

/// Pid file contents that do not pin a process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a process stamp: {0:?}")]
pub struct StampParseError(String);

impl FromStr for ProcessStamp {
    type Err = StampParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StampParseError(s.trim().to_string());
        let mut parts = s.split_whitespace();
        let pid = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let start_time = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let boot_id = match parts.next().ok_or_else(invalid)? {
            "-" => None,
            id => Some(id.to_string()),
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self {
            pid,
            start_time,
            boot_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_parse_survives_hostile_comm() {
        let line = "4242 (evil) S 1 2 3) R 1 4242 4242 0 -1 4194560 100 0 0 0 \
                    1 2 0 0 20 0 1 0 987654 1000000 100 18446744073709551615";
        let stat = ProcStat::parse(line).unwrap();
        assert_eq!(stat.state, 'R');
        assert_eq!(stat.start_time, 987_654);
        assert!(ProcStat::parse("garbage").is_none());
    }

    #[test]
    fn test_own_stamp_is_live() {
        let stamp = ProcessStamp::capture(std::process::id()).unwrap();
        assert!(stamp.is_live());

        let reused = ProcessStamp {
            start_time: stamp.start_time + 1,
            ..stamp.clone()
        };
        assert!(!reused.is_live());

        let other_boot = ProcessStamp {
            boot_id: Some("00000000-0000-0000-0000-000000000000".to_string()),
            ..stamp
        };
        assert!(!other_boot.is_live());
    }

    #[test]
    fn test_reaped_and_zombie_children_are_not_live() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let stamp = ProcessStamp::capture(child.id()).unwrap();
        assert!(stamp.is_live());

        child.kill().unwrap();
        // Not reaped yet: the pid still exists, as a zombie.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while stamp.is_live() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(!stamp.is_live());

        child.wait().unwrap();
        assert!(!stamp.is_live());
    }

    #[test]
    fn test_pid_file_form() {
        let stamp = ProcessStamp {
            pid: 17,
            start_time: 99,
            boot_id: None,
        };
        assert_eq!(stamp.to_string(), "17 99 -");
        assert_eq!("17 99 -\n".parse::<ProcessStamp>().unwrap(), stamp);

        let booted = ProcessStamp {
            boot_id: Some("abc".to_string()),
            ..stamp
        };
        assert_eq!(booted.to_string().parse::<ProcessStamp>().unwrap(), booted);

        // A bare pid pins nothing.
        assert!("17\n".parse::<ProcessStamp>().is_err());
        assert!("17 99 abc extra".parse::<ProcessStamp>().is_err());
    }

    #[test]
    fn test_alternative_proc_root() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("77");
        std::fs::create_dir(&dir).unwrap();
        let mut fields = vec!["0"; 20];
        fields[0] = "S";
        fields[19] = "555";
        std::fs::write(dir.join("stat"), format!("77 (x) {}", fields.join(" "))).unwrap();

        let stamp = ProcessStamp {
            pid: 77,
            start_time: 555,
            boot_id: None,
        };
        assert!(stamp.matches(tmp.path(), None));
        assert!(!stamp.matches(tmp.path(), Some("boot")));
        assert_eq!(ProcStat::read(tmp.path(), 78), None);
    }
}
