use std::fs::create_dir_all;
use std::panic::RefUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use crate::image::{ImageConfig, ImageIndex, ImageManifest};
use crate::{Cgroup, Error, Mount, UserMapper};

/// One container launch: a generated id, the bundle directory it was
/// materialized into, and the pieces the launcher assembled while preparing
/// it (overlay mounts, cgroup, id mapper, decoded image metadata).
///
/// The identifier doubles as the container's hostname and as the leaf name
/// of its cgroup, so it must be a legal hostname (at most 253 bytes, no `/`).
pub struct Container {
    pub(crate) id: String,
    pub(crate) bundle_dir: PathBuf,
    pub(crate) rootfs: PathBuf,
    pub(crate) cgroup: Cgroup,
    pub(crate) user_mapper: Arc<dyn UserMapper + RefUnwindSafe>,
    pub(crate) mounts: Vec<Arc<dyn Mount + RefUnwindSafe>>,
    pub(crate) index: Option<ImageIndex>,
    pub(crate) manifest: Option<ImageManifest>,
    pub(crate) config: Option<ImageConfig>,
}

#[derive(Default)]
pub struct ContainerOptions {
    id: Option<String>,
    bundle_dir: Option<PathBuf>,
    rootfs: Option<PathBuf>,
    cgroup: Option<Cgroup>,
    user_mapper: Option<Arc<dyn UserMapper + RefUnwindSafe>>,
    mounts: Vec<Arc<dyn Mount + RefUnwindSafe>>,
    index: Option<ImageIndex>,
    manifest: Option<ImageManifest>,
    config: Option<ImageConfig>,
}

impl ContainerOptions {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn id(mut self, id: impl ToString) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn bundle_dir(mut self, bundle_dir: PathBuf) -> Self {
        self.bundle_dir = Some(bundle_dir);
        self
    }

    pub fn rootfs(mut self, rootfs: PathBuf) -> Self {
        self.rootfs = Some(rootfs);
        self
    }

    pub fn cgroup(mut self, cgroup: Cgroup) -> Self {
        self.cgroup = Some(cgroup);
        self
    }

    pub fn user_mapper<T: UserMapper + RefUnwindSafe + 'static>(mut self, user_mapper: T) -> Self {
        self.user_mapper = Some(Arc::new(user_mapper));
        self
    }

    pub fn add_mount<T: Mount + RefUnwindSafe + 'static>(mut self, mount: T) -> Self {
        self.mounts.push(Arc::new(mount));
        self
    }

    pub fn image(
        mut self,
        index: ImageIndex,
        manifest: ImageManifest,
        config: ImageConfig,
    ) -> Self {
        self.index = Some(index);
        self.manifest = Some(manifest);
        self.config = Some(config);
        self
    }

    pub fn create(self) -> Result<Container, Error> {
        let id = self.id.ok_or("container id should be specified")?;
        if id.is_empty() || id.len() > 253 || id.contains('/') {
            return Err(format!("invalid container id: {id:?}").into());
        }
        let bundle_dir = self
            .bundle_dir
            .ok_or("container bundle directory should be specified")?;
        let rootfs = self.rootfs.ok_or("container rootfs should be specified")?;
        let cgroup = self.cgroup.ok_or("container cgroup should be specified")?;
        let user_mapper = self
            .user_mapper
            .ok_or("container user mapper should be specified")?;
        create_dir_all(&bundle_dir)?;
        create_dir_all(&rootfs)?;
        cgroup.create()?;
        Ok(Container {
            id,
            bundle_dir,
            rootfs,
            cgroup,
            user_mapper,
            mounts: self.mounts,
            index: self.index,
            manifest: self.manifest,
            config: self.config,
        })
    }
}

impl Container {
    pub fn options() -> ContainerOptions {
        ContainerOptions::new()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bundle_dir(&self) -> &PathBuf {
        &self.bundle_dir
    }

    pub fn cgroup(&self) -> &Cgroup {
        &self.cgroup
    }
}
