use std::convert::Infallible;
use std::ffi::CString;
use std::fs;
use std::panic::catch_unwind;
use std::path::{Path, PathBuf};

use nix::unistd::{execvpe, getgid, getuid, sethostname, Gid, Uid};
use tracing::info;

use crate::cgroup::CgroupLimits;
use crate::image::{self, ImageConfig, ImageIndex, ImageManifest};
use crate::{
    exit_child, new_pipe, read_ok, run_as_root, setup_mount_namespace, write_ok, BaseMounts,
    Cgroup, Clone, CloneArgs, Container, Error, IdMap, OverlayMount, ProcUserMapper, UserMapper,
};

const CGROUP_CONTROLLERS: &[&str] = &["cpu", "io", "memory", "pids"];

/// Everything `rocked run` needs to launch one container, gathered from CLI
/// arguments before any syscalls happen.
pub struct RunOptions {
    pub image_archive: PathBuf,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub state_dir: PathBuf,
    pub cgroup_root: PathBuf,
    pub cgroup_limits: CgroupLimits,
    /// Host path the container's stdout is redirected to, if set. The file is
    /// opened on the host before the clone boundary, so it stays reachable by
    /// fd after the child's `pivot_root` regardless of what the container's
    /// rootfs contains.
    pub stdout: Option<PathBuf>,
}

impl RunOptions {
    pub fn new(image_archive: PathBuf, argv: Vec<String>) -> Self {
        Self {
            image_archive,
            argv,
            env: Vec::new(),
            state_dir: PathBuf::from("/tmp/containers"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/rocked"),
            cgroup_limits: CgroupLimits::default(),
            stdout: None,
        }
    }
}

/// Builds a bundle directory, an overlay root and a cgroup from `options`,
/// clones the container process into them, and waits for it. Returns the
/// exit code the `rocked` binary should forward to its own caller.
pub fn run(options: RunOptions) -> Result<i32, Error> {
    let id = generate_id();
    let bundle_dir = options.state_dir.join(&id);
    info!(container = %id, "preparing bundle");

    // --- parent, pre-clone: image bundle (component 4.2) ---
    fs::create_dir_all(&bundle_dir)?;
    let image_root = bundle_dir.join("image_root");
    let (index, manifest, config) = prepare_image(&options.image_archive, &bundle_dir, &image_root)?;

    // --- parent, pre-clone: overlay scaffold (component 4.3) ---
    let overlay_dir = bundle_dir.join("overlay");
    let upper_dir = overlay_dir.join("upper");
    let work_dir = overlay_dir.join("work");
    let merge_dir = overlay_dir.join("merge");
    create_dir_mode(&upper_dir, 0o770)?;
    create_dir_mode(&work_dir, 0o770)?;
    create_dir_mode(&merge_dir, 0o770)?;

    // --- parent, pre-clone: cgroup (component 4.4) ---
    let cgroup_mount_path = options
        .cgroup_root
        .parent()
        .ok_or("cgroup_root must have a parent directory")?;
    let cgroup_name = options
        .cgroup_root
        .file_name()
        .ok_or("cgroup_root must not be empty")?;
    let cgroup_mount = Cgroup::new(cgroup_mount_path, "")?;
    cgroup_mount
        .add_subtree_controllers(CGROUP_CONTROLLERS.iter().map(|v| v.to_string()).collect())
        .map_err(|err| format!("cannot enable controllers at {}: {err}", cgroup_mount.as_path().display()))?;
    let rocked_cgroup = Cgroup::new(cgroup_mount_path, cgroup_name)?;
    rocked_cgroup.create()?;
    rocked_cgroup
        .add_subtree_controllers(CGROUP_CONTROLLERS.iter().map(|v| v.to_string()).collect())
        .map_err(|err| format!("cannot enable controllers at {}: {err}", rocked_cgroup.as_path().display()))?;
    let leaf_cgroup = rocked_cgroup.child(&id)?;
    leaf_cgroup.create()?;
    leaf_cgroup.apply_limits(&options.cgroup_limits)?;
    let cgroup_file = leaf_cgroup.open()?;

    // --- parent, pre-clone: stdout capture (tests only, disabled by default) ---
    let stdout_file = options
        .stdout
        .as_ref()
        .map(fs::File::create)
        .transpose()
        .map_err(|err| format!("cannot create stdout capture file: {err}"))?;

    let host_uid = getuid();
    let host_gid = getgid();
    let user_mapper = ProcUserMapper::new_root(host_uid, host_gid);

    let container = Container::options()
        .id(id.clone())
        .bundle_dir(bundle_dir.clone())
        .rootfs(merge_dir.clone())
        .cgroup(leaf_cgroup.clone())
        .user_mapper(user_mapper)
        .add_mount(OverlayMount::new(vec![image_root], upper_dir, work_dir))
        .add_mount(BaseMounts::new())
        .image(index, manifest, config)
        .create()?;

    let mut env = default_env();
    env.extend(options.env.iter().cloned());
    let argv = options.argv;

    // --- clone boundary ---
    // CLONE_NEWNS/CLONE_NEWUTS are deliberately not requested here: the
    // child takes them itself via unshare() after the pipe handshake, per
    // spec. CLONE_VFORK is deliberately not requested either, even though
    // spec.md's flags table names it: CLONE_VFORK suspends this parent
    // inside clone3() until the child execs or exits, which would deadlock
    // against the pipe handshake below (the child can't reach exec until
    // the parent writes the id maps and unblocks the pipe, which the parent
    // can't do while frozen in clone3()).
    let sync_pipe = new_pipe()?;
    let mut clone_args = CloneArgs::default();
    clone_args.flag_newuser();
    clone_args.flag_files();
    clone_args.flag_newpid();
    clone_args.flag_newnet();
    clone_args.flag_into_cgroup(&cgroup_file);
    let clone_result =
        unsafe { crate::clone3(&clone_args) }.map_err(|err| format!("clone3 failed: {err}"))?;

    match clone_result {
        Clone::Child => {
            let _ = catch_unwind(move || {
                drop(cgroup_file);
                let rx = sync_pipe.rx();
                exit_child(child_main(container, argv, env, rx, stdout_file))
            });
            unsafe { nix::libc::_exit(2) }
        }
        Clone::Parent(child) => {
            drop(cgroup_file);
            // --- parent, post-clone: id maps (component 4.5 step 6) ---
            let uid_map = vec![IdMap {
                container_id: Uid::from_raw(0),
                host_id: host_uid,
                size: 1,
            }];
            let gid_map = vec![IdMap {
                container_id: Gid::from_raw(0),
                host_id: host_gid,
                size: 1,
            }];
            let map_result = ProcUserMapper {
                uid_map,
                gid_map,
                set_groups: false,
            }
            .run_map_user(child);
            // Unblock the child regardless of whether the id-map write
            // succeeded: a mapping failure must still be observed and
            // reaped below, not leave the child stuck forever on the pipe.
            let unblock_result = write_ok(sync_pipe.tx());

            // --- parent, post-clone: wait (component 4.5 step 7) ---
            // Always reap the child, even if the steps above failed, so a
            // broken id-map write can never leak an unreaped/orphaned child.
            let status = nix::sys::wait::waitpid(child, None);
            // --- parent, post-clone: cleanup (component 4.5 step 8) ---
            let _ = fs::remove_dir_all(&bundle_dir);
            let _ = leaf_cgroup.remove();

            map_result?;
            unblock_result?;
            Ok(exit_code_of(status?))
        }
    }
}

fn child_main(
    container: Container,
    argv: Vec<String>,
    env: Vec<String>,
    sync_rx: impl std::io::Read,
    stdout_file: Option<fs::File>,
) -> Result<Infallible, Error> {
    // Step 1: block until the parent has written the id maps.
    read_ok(sync_rx)?;
    // Step 2: mount and UTS namespaces are taken here, not at clone3 time,
    // because the new user namespace (already active at this point) affects
    // permission to create them.
    nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWNS | nix::sched::CloneFlags::CLONE_NEWUTS)?;
    // Steps 3-6: mount namespace setup, hostname, overlay + virtual filesystems.
    sethostname(container.id())?;
    setup_mount_namespace(&container)?;
    // Step 9/10 happen inside setup_mount_namespace's pivot_root + umount2;
    // only the exec remains. The capture file (if any) was opened on the host
    // before pivot_root, so its fd still refers to the host file afterwards;
    // dup2 it over stdout right before exec.
    if let Some(file) = stdout_file {
        nix::unistd::dup2(std::os::fd::AsRawFd::as_raw_fd(&file), nix::libc::STDOUT_FILENO)?;
    }
    let filename = CString::new(argv[0].as_bytes())?;
    let argv = Result::<Vec<_>, _>::from_iter(argv.iter().map(|v| CString::new(v.as_bytes())))?;
    let envp = Result::<Vec<_>, _>::from_iter(env.iter().map(|v| CString::new(v.as_bytes())))?;
    Ok(execvpe(&filename, &argv, &envp)?)
}

fn prepare_image(
    archive: &Path,
    bundle_dir: &Path,
    image_root: &Path,
) -> Result<(ImageIndex, ImageManifest, ImageConfig), Error> {
    let file = fs::File::open(archive)
        .map_err(|err| format!("cannot open image archive {archive:?}: {err}"))?;
    image::extract_archive(file, bundle_dir)?;
    let index = image::read_index(bundle_dir)?;
    let manifest_descriptor = index
        .manifests
        .first()
        .ok_or("image index has no manifests")?;
    let manifest = image::read_manifest(bundle_dir, manifest_descriptor)?;
    let config = image::read_config(bundle_dir, &manifest.config)?;
    fs::create_dir_all(image_root)?;

    // Layer entries are typically owned by container-root; extracting them
    // with ownership preserved (as extract_layer does, so the overlay lower
    // dir matches the image) needs CAP_CHOWN over those ids, which this
    // unprivileged parent does not have. Run each layer's extraction inside
    // a throwaway user namespace with getuid() mapped to root, the same way
    // the rootfs unpack is done as mapped root rather than as the invoking
    // user.
    let user_mapper = ProcUserMapper::default();
    for layer in &manifest.layers {
        layer.digest.require_known_algorithm()?;
        let blob = image::blob_path(bundle_dir, &layer.digest);
        let image_root = image_root.to_path_buf();
        run_as_root(&user_mapper, move || {
            let file = fs::File::open(&blob)
                .map_err(|err| format!("cannot open layer blob {blob:?}: {err}"))?;
            image::extract_layer(file, &image_root)
        })?;
    }
    Ok((index, manifest, config))
}

fn create_dir_mode(path: &Path, mode: u32) -> Result<(), Error> {
    use std::os::unix::fs::DirBuilderExt as _;
    match fs::DirBuilder::new().mode(mode).create(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn default_env() -> Vec<String> {
    vec![
        "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_owned(),
        "TERM=xterm".to_owned(),
    ]
}

fn exit_code_of(status: nix::sys::wait::WaitStatus) -> i32 {
    use nix::sys::wait::WaitStatus::*;
    match status {
        Exited(_, code) => code,
        Signaled(_, signal, _) => 128 + signal as i32,
        _ => 1,
    }
}

fn generate_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    // Seeded from the monotonic-ish wall clock and this process's pid: unique
    // enough for one runtime process launching containers one at a time,
    // which is this crate's concurrency model (see the launcher's design
    // notes on the clone boundary being the only concurrency point).
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("rocked-{:x}-{:x}", std::process::id(), nanos)
}
