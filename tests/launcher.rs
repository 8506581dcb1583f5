mod common;

use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use common::TempDir;
use nix::unistd::Uid;
use rocked::RunOptions;
use tar::{Builder, Header};

/// The end-to-end scenarios (E1-E6) all require root (for clone3 with
/// CLONE_NEWUSER/CLONE_NEWNS/CLONE_NEWPID/CLONE_NEWNET and for cgroup-v2
/// delegation) and a kernel new enough to support clone3 (5.7+). Skip
/// gracefully rather than failing CI runs that can't provide either, mirroring
/// the way the pack's own container test suites gate on a delegated test
/// cgroup via TEST_CGROUP_PATH.
fn e2e_available() -> bool {
    Uid::current().is_root() && Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
}

fn skip_reason() -> &'static str {
    "skipping end-to-end container scenario: requires root and cgroup-v2 delegation"
}

/// Builds a minimal OCI bundle tar containing one layer whose root is a
/// statically-linked `/bin/sh` copied from the host (busybox's `sh` is
/// statically linked on most distros' musl builds; skip if none is found).
fn build_image_archive(dir: &TempDir) -> Option<PathBuf> {
    let sh = ["/bin/busybox", "/usr/bin/busybox"]
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.exists())?;
    let layer_path = dir.join("layer.tar");
    {
        let mut layer = Builder::new(File::create(&layer_path).ok()?);
        layer.append_path_with_name(&sh, "bin/sh").ok()?;
        layer.finish().ok()?;
    }
    let config_json = br#"{"config":{"Env":[],"Entrypoint":[],"Cmd":[]}}"#;
    let manifest_json = serde_json::json!({
        "schemaVersion": 2,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": "sha256:config",
            "size": config_json.len(),
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar",
            "digest": "sha256:layer",
            "size": fs::metadata(&layer_path).ok()?.len(),
        }],
    });
    let index_json = serde_json::json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": "sha256:manifest",
            "size": 0,
        }],
    });

    let archive_path = dir.join("image.tar");
    let mut archive = Builder::new(File::create(&archive_path).ok()?);
    append_bytes(&mut archive, "index.json", index_json.to_string().as_bytes());
    append_bytes(
        &mut archive,
        "blobs/sha256/manifest",
        manifest_json.to_string().as_bytes(),
    );
    append_bytes(&mut archive, "blobs/sha256/config", config_json);
    let mut layer_bytes = Vec::new();
    std::io::copy(&mut File::open(&layer_path).ok()?, &mut layer_bytes).ok()?;
    append_bytes(&mut archive, "blobs/sha256/layer", &layer_bytes);
    archive.finish().ok()?;
    Some(archive_path)
}

fn append_bytes(archive: &mut Builder<File>, name: &str, data: &[u8]) {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    archive.append_data(&mut header, name, data).unwrap();
}

#[test]
fn test_run_rejects_missing_image_archive() {
    // Doesn't need root: fails during image bundle preparation, before the
    // clone boundary, so the launcher's own validation path is exercised
    // without needing any kernel privilege.
    let tmp = TempDir::new().unwrap();
    let options = RunOptions::new(tmp.join("no-such-image.tar"), vec!["/bin/true".into()]);
    let err = rocked::run(options).unwrap_err();
    assert!(err.to_string().contains("cannot open image archive"));
}

#[test]
fn test_e1_run_true_exits_zero() {
    if !e2e_available() {
        eprintln!("{}", skip_reason());
        return;
    }
    let tmp = TempDir::new().unwrap();
    let Some(archive) = build_image_archive(&tmp) else {
        eprintln!("no busybox binary available to build a fixture image, skipping");
        return;
    };
    let mut options = RunOptions::new(archive, vec!["/bin/sh".into(), "-c".into(), "true".into()]);
    options.state_dir = tmp.join("state");
    let code = rocked::run(options).unwrap();
    assert_eq!(code, 0);
}

#[test]
fn test_e2_run_forwards_nonzero_exit_code() {
    if !e2e_available() {
        eprintln!("{}", skip_reason());
        return;
    }
    let tmp = TempDir::new().unwrap();
    let Some(archive) = build_image_archive(&tmp) else {
        eprintln!("no busybox binary available to build a fixture image, skipping");
        return;
    };
    let mut options = RunOptions::new(
        archive,
        vec!["/bin/sh".into(), "-c".into(), "exit 7".into()],
    );
    options.state_dir = tmp.join("state");
    let code = rocked::run(options).unwrap();
    assert_eq!(code, 7);
}

#[test]
fn test_e6_run_cleans_up_bundle_dir_on_success() {
    if !e2e_available() {
        eprintln!("{}", skip_reason());
        return;
    }
    let tmp = TempDir::new().unwrap();
    let Some(archive) = build_image_archive(&tmp) else {
        eprintln!("no busybox binary available to build a fixture image, skipping");
        return;
    };
    let state_dir = tmp.join("state");
    let mut options = RunOptions::new(archive, vec!["/bin/sh".into(), "-c".into(), "true".into()]);
    options.state_dir = state_dir.clone();
    rocked::run(options).unwrap();
    let remaining: Vec<_> = fs::read_dir(&state_dir).unwrap().collect();
    assert!(remaining.is_empty(), "bundle directory was not cleaned up");
}

#[test]
fn test_e3_run_sees_only_its_own_pid_namespace() {
    if !e2e_available() {
        eprintln!("{}", skip_reason());
        return;
    }
    let tmp = TempDir::new().unwrap();
    let Some(archive) = build_image_archive(&tmp) else {
        eprintln!("no busybox binary available to build a fixture image, skipping");
        return;
    };
    let capture = tmp.join("stdout");
    let mut options = RunOptions::new(archive, vec!["/bin/sh".into(), "-c".into(), "echo $$".into()]);
    options.state_dir = tmp.join("state");
    options.stdout = Some(capture.clone());
    let code = rocked::run(options).unwrap();
    assert_eq!(code, 0);
    // A process that's cloned with CLONE_NEWPID and then exec'd directly (no
    // intermediate shell fork) is pid 1 in its own namespace.
    let seen_pid = fs::read_to_string(&capture).unwrap();
    assert_eq!(seen_pid.trim(), "1");
}

#[test]
fn test_e4_run_hostname_matches_container_id() {
    if !e2e_available() {
        eprintln!("{}", skip_reason());
        return;
    }
    let tmp = TempDir::new().unwrap();
    let Some(archive) = build_image_archive(&tmp) else {
        eprintln!("no busybox binary available to build a fixture image, skipping");
        return;
    };
    let capture = tmp.join("stdout");
    // Reads the hostname back via the shell's `read` builtin rather than a
    // "hostname" or "cat" binary: the fixture image only extracts busybox as
    // /bin/sh, with no applet symlinks for either.
    let mut options = RunOptions::new(
        archive,
        vec![
            "/bin/sh".into(),
            "-c".into(),
            "read -r h < /proc/sys/kernel/hostname && echo \"$h\"".into(),
        ],
    );
    options.state_dir = tmp.join("state");
    options.stdout = Some(capture.clone());
    let code = rocked::run(options).unwrap();
    assert_eq!(code, 0);
    let seen_hostname = fs::read_to_string(&capture).unwrap();
    // run() doesn't hand the generated container id back to the caller, so
    // this only checks the id format the launcher generates, not an exact
    // match against a value the test otherwise has no way to observe.
    assert!(
        seen_hostname.trim().starts_with("rocked-"),
        "unexpected hostname: {seen_hostname:?}"
    );
}

#[test]
fn test_e5_run_enforces_cgroup_memory_limit() {
    if !e2e_available() {
        eprintln!("{}", skip_reason());
        return;
    }
    let tmp = TempDir::new().unwrap();
    let Some(archive) = build_image_archive(&tmp) else {
        eprintln!("no busybox binary available to build a fixture image, skipping");
        return;
    };
    let mut options = RunOptions::new(
        archive,
        vec![
            "/bin/sh".into(),
            "-c".into(),
            // Doubles a shell variable in a tight loop: pure builtins, no
            // external binary needed (the fixture image has only /bin/sh).
            // Grows exponentially past any small memory.max within a
            // handful of iterations.
            "s=x; while :; do s=\"$s$s\"; done".into(),
        ],
    );
    options.state_dir = tmp.join("state");
    options.cgroup_limits.memory_max = 8 * 1024 * 1024;
    let code = rocked::run(options).unwrap();
    assert_eq!(
        code,
        128 + 9,
        "expected the shell to be SIGKILLed by the OOM killer"
    );
}
