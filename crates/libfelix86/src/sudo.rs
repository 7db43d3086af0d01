//! Sudo lifecycle.
//!
//! Some setups (binfmt_misc registration, chroot-capable guests) need the
//! emulator to start as root and shed the privilege once the privileged
//! step is done.

use std::env;
use std::ffi::CString;

use anyhow::{bail, Context, Result};
use nix::unistd::{setgid, setuid, Gid, Uid};

pub fn has_permissions() -> bool {
    Uid::effective().is_root()
}

/// Re-executes ourselves under `sudo -E`, preserving the environment so
/// FELIX86_* settings survive. Only returns on failure.
pub fn request_permissions(args: &[String]) -> Result<()> {
    let mut sudo_args = vec![
        CString::new("sudo").expect("static string"),
        CString::new("-E").expect("static string"),
    ];
    for arg in args {
        sudo_args.push(CString::new(arg.as_str()).context("argument contains a nul byte")?);
    }

    let program = CString::new("sudo").expect("static string");
    nix::unistd::execvp(&program, &sudo_args).context("failed to elevate permissions")?;
    unreachable!("execvp returned without an error");
}

/// Drops root privileges back to the sudo-invoking user. Refuses to run
/// with only half the identity available; aborts if the kernel claims
/// success but the process is somehow still root.
pub fn drop_permissions() -> Result<()> {
    let (Ok(uid_env), Ok(gid_env)) = (env::var("SUDO_UID"), env::var("SUDO_GID")) else {
        bail!("SUDO_UID or SUDO_GID not set, can't drop root privileges");
    };

    let uid: u32 = uid_env.parse().context("SUDO_UID is not a number")?;
    let gid: u32 = gid_env.parse().context("SUDO_GID is not a number")?;

    setgid(Gid::from_raw(gid)).context("setgid failed when trying to drop root privileges")?;
    setuid(Uid::from_raw(uid)).context("setuid failed when trying to drop root privileges")?;

    if Uid::effective().is_root() || Uid::current().is_root() {
        tracing::error!("failed to drop root privileges?");
        std::process::abort();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn drop_without_sudo_environment_fails() {
        if has_permissions() {
            // Dropping for real would take the whole test process down
            // with it.
            return;
        }
        let old_uid = env::var_os("SUDO_UID");
        let old_gid = env::var_os("SUDO_GID");
        env::remove_var("SUDO_UID");
        env::remove_var("SUDO_GID");

        let result = drop_permissions();

        if let Some(v) = old_uid {
            env::set_var("SUDO_UID", v);
        }
        if let Some(v) = old_gid {
            env::set_var("SUDO_GID", v);
        }
        assert!(result.is_err());
    }
}
