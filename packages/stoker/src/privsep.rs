//! The worker privilege drop. Ordering is load-bearing: the user lookup
//! must happen before chroot, the descriptor-limit raise before the uid
//! drop. Every required step is fatal for the worker.

use std::path::PathBuf;

use log::warn;
use nix::sys::resource::{Resource, getrlimit, setrlimit};
use nix::unistd::{User, chdir, chroot};

use crate::config::Config;
use crate::error::PrivDropError;
use crate::runtime::Hook;

/// Drops the calling worker to its unprivileged identity and invokes the
/// platform sandbox hook as the final step.
pub fn drop_privileges(cfg: &Config, sandbox: &mut Option<Hook>) -> Result<(), PrivDropError> {
    // Must resolve before chroot takes the passwd database away.
    let user = if cfg.skip_runas {
        None
    } else {
        let name = cfg.runas_user.as_deref().ok_or(PrivDropError::RunasMissing)?;
        let user = User::from_name(name)
            .map_err(|errno| PrivDropError::UserLookup {
                user: name.to_string(),
                errno,
            })?
            .ok_or_else(|| PrivDropError::UnknownUser(name.to_string()))?;
        Some(user)
    };

    let root: PathBuf = match &cfg.root_path {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };

    if cfg.skip_chroot {
        chdir(&root).map_err(|errno| PrivDropError::Chdir {
            path: root.clone(),
            errno,
        })?;
    } else {
        chroot(&root).map_err(|errno| PrivDropError::Chroot {
            path: root.clone(),
            errno,
        })?;
        chdir("/").map_err(|errno| PrivDropError::Chdir {
            path: PathBuf::from("/"),
            errno,
        })?;
    }

    let target = nofile_target(cfg.rlimit_nofiles) as u64;
    if let Err(e) = setrlimit(Resource::RLIMIT_NOFILE, target, target) {
        warn!("setrlimit(RLIMIT_NOFILE, {target}): {e}");
    }

    if let Some(user) = user {
        #[cfg(target_os = "linux")]
        {
            nix::unistd::setgroups(&[user.gid]).map_err(PrivDropError::Drop)?;
            nix::unistd::setresgid(user.gid, user.gid, user.gid).map_err(PrivDropError::Drop)?;
            nix::unistd::setresuid(user.uid, user.uid, user.uid).map_err(PrivDropError::Drop)?;
        }
        #[cfg(not(target_os = "linux"))]
        {
            nix::unistd::setgid(user.gid).map_err(PrivDropError::Drop)?;
            nix::unistd::setegid(user.gid).map_err(PrivDropError::Drop)?;
            nix::unistd::setuid(user.uid).map_err(PrivDropError::Drop)?;
            nix::unistd::seteuid(user.uid).map_err(PrivDropError::Drop)?;
        }
    }

    if let Some(hook) = sandbox {
        hook();
    }

    Ok(())
}

/// The RLIMIT_NOFILE target: the configured budget plus however many
/// descriptors the process already holds (listeners, channels, logs).
fn nofile_target(configured: u32) -> u32 {
    let mut target = configured;
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, _hard)) => {
            for fd in 0..soft.min(65_536) {
                if unsafe { libc::fcntl(fd as libc::c_int, libc::F_GETFD) } != -1 {
                    target += 1;
                }
            }
        }
        Err(e) => warn!("getrlimit(RLIMIT_NOFILE): {e}"),
    }
    target
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nofile_target_accounts_for_open_descriptors() {
        // stdin/stdout/stderr at minimum.
        assert!(nofile_target(768) >= 768 + 3);
    }

    #[test]
    fn missing_runas_user_is_fatal() {
        let cfg = Config {
            skip_runas: false,
            runas_user: None,
            ..Config::default()
        };
        let mut sandbox = None;
        assert!(matches!(
            drop_privileges(&cfg, &mut sandbox),
            Err(PrivDropError::RunasMissing)
        ));
    }

    #[test]
    fn skip_everything_still_runs_the_sandbox_hook() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let mut sandbox: Option<Hook> = Some(Box::new(move || {
            flag.store(true, Ordering::Relaxed);
        }));

        let cfg = Config {
            skip_runas: true,
            skip_chroot: true,
            root_path: Some(std::env::current_dir().expect("cwd")),
            ..Config::default()
        };
        drop_privileges(&cfg, &mut sandbox).expect("drop with skips");
        assert!(ran.load(Ordering::Relaxed));
    }
}
