use std::fs::{read, remove_dir, File};
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::{Error, Pid};

#[derive(Clone, Debug)]
pub struct Cgroup {
    mount_path: PathBuf,
    path: PathBuf,
}

const PROC_CGROUP: &str = "/proc/self/cgroup";
const CGROUP_MOUNT: &str = "/sys/fs/cgroup";
const CGROUP_PROCS: &str = "cgroup.procs";
const CGROUP_SUBTREE_CONTROL: &str = "cgroup.subtree_control";

/// CPU quota/period and memory ceiling applied to a container's leaf cgroup.
#[derive(Clone, Debug)]
pub struct CgroupLimits {
    /// `cpu.max` value, e.g. `"200000 1000000"` for 20% of one CPU.
    pub cpu_max: String,
    /// `memory.max` value in bytes.
    pub memory_max: u64,
}

impl Default for CgroupLimits {
    fn default() -> Self {
        Self {
            cpu_max: "200000 1000000".to_owned(),
            memory_max: 1024 * 1024 * 1024,
        }
    }
}

impl Cgroup {
    pub fn new(mount_path: impl Into<PathBuf>, name: impl AsRef<Path>) -> Result<Self, Error> {
        let name = name.as_ref();
        if name.is_absolute() {
            Err("Cgroup name cannot be absolute")?
        }
        let mount_path = mount_path.into();
        if !mount_path.is_absolute() {
            Err("Cgroup mount path should be absolute")?
        }
        let path = mount_path.join(name);
        Ok(Self { mount_path, path })
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &Path {
        self.path
            .strip_prefix(&self.mount_path)
            .expect("Cgroup path does not starts with mount path")
    }

    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    pub fn current() -> Result<Self, Error> {
        for line in String::from_utf8(read(PROC_CGROUP)?)?.split('\n') {
            let parts: Vec<_> = line.split(':').collect();
            if let Some(v) = parts.get(1) {
                if !v.is_empty() {
                    continue;
                }
            }
            let cgroup = parts
                .get(2)
                .ok_or("Expected cgroup path")?
                .trim_start_matches('/');
            return Cgroup::new(CGROUP_MOUNT, cgroup);
        }
        Err("Cannot resolve cgroup".into())
    }

    pub fn parent(&self) -> Option<Self> {
        let path = self.path.parent()?;
        if path.starts_with(&self.mount_path) {
            let mount_path = self.mount_path.clone();
            let path = path.to_owned();
            Some(Self { mount_path, path })
        } else {
            None
        }
    }

    pub fn child(&self, name: impl AsRef<Path>) -> Result<Self, Error> {
        let name = name.as_ref();
        if name.is_absolute() {
            Err("Child cgroup name cannot be absolute")?
        }
        let mount_path = self.mount_path.clone();
        let path = self.path.join(name);
        Ok(Self { mount_path, path })
    }

    /// `mkdir -p` with mode `0770`, matching spec.md §4.4 step 3.
    pub fn create(&self) -> Result<(), Error> {
        use std::os::unix::fs::DirBuilderExt as _;
        Ok(std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o770)
            .create(&self.path)?)
    }

    pub fn remove(&self) -> Result<(), Error> {
        Ok(remove_dir(&self.path)?)
    }

    pub fn add_process(&self, pid: Pid) -> Result<(), Error> {
        Ok(File::options()
            .create(false)
            .write(true)
            .truncate(false)
            .open(self.path.join(CGROUP_PROCS))?
            .write_all(pid.to_string().as_bytes())?)
    }

    pub fn open(&self) -> Result<File, Error> {
        Ok(File::options()
            .read(true)
            .custom_flags(nix::libc::O_PATH | nix::libc::O_DIRECTORY)
            .open(&self.path)?)
    }

    /// Controllers currently enabled for children of this cgroup.
    pub fn subtree_controllers(&self) -> Result<Vec<String>, Error> {
        let data = String::from_utf8(read(self.path.join(CGROUP_SUBTREE_CONTROL))?)?;
        Ok(data.split_whitespace().map(str::to_owned).collect())
    }

    /// Enables the given controllers in this cgroup's `cgroup.subtree_control`,
    /// one `write` per controller, so children (including leaves created
    /// later) can use them.
    pub fn add_subtree_controllers(&self, controllers: Vec<String>) -> Result<(), Error> {
        let mut file = File::options()
            .write(true)
            .open(self.path.join(CGROUP_SUBTREE_CONTROL))?;
        for controller in controllers {
            file.write_all(format!("+{controller}").as_bytes())?;
        }
        Ok(())
    }

    /// Writes `cpu.max` and `memory.max` for this (leaf) cgroup.
    pub fn apply_limits(&self, limits: &CgroupLimits) -> Result<(), Error> {
        File::options()
            .write(true)
            .open(self.path.join("cpu.max"))?
            .write_all(limits.cpu_max.as_bytes())?;
        File::options()
            .write(true)
            .open(self.path.join("memory.max"))?
            .write_all(limits.memory_max.to_string().as_bytes())?;
        Ok(())
    }
}
