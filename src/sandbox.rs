//! Local Linux sandboxes: a tmpfs root with read-only system directories.
//!
//! Requires root (mounting needs CAP_SYS_ADMIN). Each sandbox lives under
//! `<base_dir>/warmpool-<id>`; the endpoint handed to session holders is that path.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ProvisionError;
use crate::provisioner::{Provisioner, SandboxHandle};

const BIND_DIRS: [&str; 5] = ["/bin", "/lib", "/lib64", "/usr", "/etc"];
const DEVICES: [&str; 4] = ["null", "zero", "urandom", "random"];
const TMPFS_OPTIONS: &str = "size=64M,mode=755";

pub struct LocalProvisioner {
    base_dir: PathBuf,
}

impl LocalProvisioner {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn sandbox_root(&self, sandbox_id: &str) -> PathBuf {
        self.base_dir.join(format!("warmpool-{sandbox_id}"))
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    async fn create(&self, flavor: &str) -> Result<SandboxHandle, ProvisionError> {
        let id = Uuid::new_v4().simple().to_string();
        let root = self.sandbox_root(&id);

        let setup_root = root.clone();
        tokio::task::spawn_blocking(move || {
            // Undo a partial setup; no handle exists to destroy it later.
            setup_sandbox_dir(&setup_root).inspect_err(|_| cleanup_sandbox(&setup_root))
        })
        .await
        .map_err(|e| ProvisionError::Task(e.to_string()))?
        .map_err(ProvisionError::CreateFailed)?;

        info!(sandbox_id = %id, root = ?root, flavor, "local sandbox created");
        Ok(SandboxHandle {
            endpoint: root.display().to_string(),
            id,
            flavor: flavor.to_string(),
        })
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<(), ProvisionError> {
        let root = self.sandbox_root(sandbox_id);
        let id = sandbox_id.to_string();
        tokio::task::spawn_blocking(move || {
            if !root.exists() {
                debug!(sandbox_id = %id, "sandbox root already gone");
                return Ok(());
            }
            cleanup_sandbox(&root);
            if root.exists() {
                return Err(ProvisionError::DestroyFailed {
                    id,
                    reason: format!("{} still present after cleanup", root.display()),
                });
            }
            Ok(())
        })
        .await
        .map_err(|e| ProvisionError::Task(e.to_string()))?
    }

    async fn health_check(&self, sandbox_id: &str) -> bool {
        let root = self.sandbox_root(sandbox_id);
        tokio::task::spawn_blocking(move || {
            root.join("tmp").is_dir() && root.join("bin").is_dir() && root.join("proc/self").exists()
        })
        .await
        .unwrap_or(false)
    }
}

fn setup_sandbox_dir(sandbox_root: &Path) -> Result<(), String> {
    if sandbox_root.exists() {
        cleanup_sandbox(sandbox_root);
    }

    fs::create_dir_all(sandbox_root).map_err(|e| format!("mkdir: {}", e))?;

    mount(
        Some("tmpfs"),
        sandbox_root,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some(TMPFS_OPTIONS),
    )
    .map_err(|e| format!("mount tmpfs: {}", e))?;

    // System directories, read-only
    for dir in &BIND_DIRS {
        let target = sandbox_root.join(&dir[1..]);
        if !Path::new(dir).exists() {
            continue;
        }
        fs::create_dir_all(&target).map_err(|e| format!("mkdir {}: {}", dir, e))?;
        mount(
            Some(*dir),
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| format!("bind mount {}: {}", dir, e))?;
        mount(
            None::<&str>,
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| format!("remount ro {}: {}", dir, e))?;
    }

    let tmp_dir = sandbox_root.join("tmp");
    fs::create_dir_all(&tmp_dir).map_err(|e| format!("mkdir tmp: {}", e))?;
    fs::set_permissions(&tmp_dir, fs::Permissions::from_mode(0o1777))
        .map_err(|e| format!("chmod tmp: {}", e))?;

    let dev_dir = sandbox_root.join("dev");
    fs::create_dir_all(&dev_dir).map_err(|e| format!("mkdir dev: {}", e))?;
    for dev in &DEVICES {
        let host_dev = format!("/dev/{}", dev);
        let sandbox_dev = dev_dir.join(dev);
        if !Path::new(&host_dev).exists() {
            continue;
        }
        fs::write(&sandbox_dev, "").map_err(|e| format!("touch {}: {}", dev, e))?;
        mount(
            Some(host_dev.as_str()),
            &sandbox_dev,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| format!("bind mount {}: {}", dev, e))?;
    }

    let proc_dir = sandbox_root.join("proc");
    fs::create_dir_all(&proc_dir).map_err(|e| format!("mkdir proc: {}", e))?;
    mount(
        Some("proc"),
        &proc_dir,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| format!("mount proc: {}", e))?;

    let home_dir = sandbox_root.join("home");
    fs::create_dir_all(&home_dir).map_err(|e| format!("mkdir home: {}", e))?;
    fs::set_permissions(&home_dir, fs::Permissions::from_mode(0o755))
        .map_err(|e| format!("chmod home: {}", e))?;

    Ok(())
}

fn cleanup_sandbox(sandbox_root: &Path) {
    for dev in &DEVICES {
        let _ = umount2(&sandbox_root.join("dev").join(dev), MntFlags::MNT_DETACH);
    }
    let mount_points = ["proc", "etc", "usr", "lib64", "lib", "bin"];
    for mp in &mount_points {
        let path = sandbox_root.join(mp);
        if path.exists() {
            let _ = umount2(&path, MntFlags::MNT_DETACH);
        }
    }
    let _ = umount2(sandbox_root, MntFlags::MNT_DETACH);
    let _ = fs::remove_dir_all(sandbox_root);
}
