//! Switching to an unprivileged user once the capture sources are open.

use std::ffi::{CStr, CString};
use std::io;

use log::info;

use crate::{Error, Result};

/// Become `user`: supplementary groups, then group, then user id.
pub fn drop_privileges(user: &str) -> Result<()> {
    let name = CString::new(user)
        .map_err(|_| Error::Config(format!("user name '{user}' contains a NUL byte")))?;
    let pw = unsafe { libc::getpwnam(name.as_ptr()) };
    if pw.is_null() {
        return Err(Error::Config(format!("cannot find user '{user}'")));
    }
    let (pw_name, uid, gid) = unsafe { (CStr::from_ptr((*pw).pw_name).to_owned(), (*pw).pw_uid, (*pw).pw_gid) };

    let failed = |step: &str| {
        Error::Config(format!(
            "cannot switch to user '{user}' ({step}): {}",
            io::Error::last_os_error()
        ))
    };
    if unsafe { libc::initgroups(pw_name.as_ptr(), gid) } != 0 {
        return Err(failed("initgroups"));
    }
    if unsafe { libc::setgid(gid) } != 0 {
        return Err(failed("setgid"));
    }
    if unsafe { libc::setuid(uid) } != 0 {
        return Err(failed("setuid"));
    }
    info!("running as {user} (uid {uid}, gid {gid})");
    Ok(())
}
