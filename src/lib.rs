mod cgroup;
pub mod cli;
mod clone3;
mod container;
mod error;
pub mod image;
mod launcher;
mod mounts;
mod syscall;
mod user;

pub use cgroup::{Cgroup, CgroupLimits};
pub use container::{Container, ContainerOptions};
pub use error::{AlgorithmError, Error, MediaTypeError};
pub use image::{Descriptor, Digest, ImageConfig, ImageIndex, ImageManifest};
pub use launcher::{run, RunOptions};
pub use mounts::{BaseMounts, Mount, OverlayMount};
pub use user::{run_as_root, run_as_user, BinNewIdMapper, Gid, IdMap, ProcUserMapper, Uid, UserMapper};

pub use clone3::Pid;
pub(crate) use clone3::{clone3, Clone, CloneArgs};
pub(crate) use error::ignore_kind;
pub(crate) use mounts::setup_mount_namespace;
pub(crate) use syscall::{
    exit_child, new_pipe, pidfd_open, read_ok, read_result, write_ok, write_result, OwnedPid,
};
