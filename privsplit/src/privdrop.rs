//! Privilege descent: pre-chroot hook, chroot, uid/gid drop.

use crate::{error::Error, runtime::Runtime, topology::Hook};
use nix::unistd::{chdir, chroot, setgroups, setresgid, setresuid, User};
use std::path::Path;

/// Apply the configured descent steps for the current process, in order:
/// pre-chroot hook, chroot + chdir to `/`, then group and user change.
/// Steps without configuration are skipped. Runs after the control
/// channels are established and before the entrypoint.
pub(crate) fn descend(runtime: &Runtime, pre_chroot: Option<Hook>) -> Result<(), Error> {
    if let Some(hook) = pre_chroot {
        hook(runtime)?;
    }

    let info = runtime
        .process(runtime.current())
        .ok_or_else(|| Error::UnknownProcess(runtime.current().to_string()))?;

    if let Some(path) = &info.chroot {
        chroot(path.as_path()).map_err(|err| Error::Privdrop("chroot", err))?;
        chdir(Path::new("/")).map_err(|err| Error::Privdrop("chdir", err))?;
        log::debug!("{}: chrooted to {}", runtime.current(), path.display());
    }

    if let Some(username) = &info.username {
        let user =
            User::from_name(username)?.ok_or_else(|| Error::UserNotFound(username.clone()))?;
        setgroups(&[user.gid]).map_err(|err| Error::Privdrop("setgroups", err))?;
        setresgid(user.gid, user.gid, user.gid).map_err(|err| Error::Privdrop("setregid", err))?;
        setresuid(user.uid, user.uid, user.uid).map_err(|err| Error::Privdrop("setreuid", err))?;
        log::debug!(
            "{}: dropped privileges to {} ({}:{})",
            runtime.current(),
            username,
            user.uid,
            user.gid
        );
    }

    Ok(())
}
