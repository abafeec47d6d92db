//! Turning a requested identity into concrete uid/gid credentials.

use forker_protocol::{Identity, LaunchError};

/// Concrete credentials a child is switched to after fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub const ROOT: Credentials = Credentials { uid: 0, gid: 0 };
}

/// Resolves an identity to credentials for a direct setuid switch.
///
/// `None` means no switch is needed.  `FixedPasswordSudo` resolves to root:
/// the password only matters on the helper path, a privileged process can
/// switch without it.
pub fn resolve(identity: &Identity) -> Result<Option<Credentials>, LaunchError> {
    match identity {
        Identity::Current => Ok(None),
        Identity::Administrator | Identity::FixedPasswordSudo(_) => {
            Ok(Some(Credentials::ROOT))
        }
        Identity::Uid(uid) => {
            let gid = lookup_uid(*uid).map(|(_, gid)| gid).unwrap_or(*uid);
            Ok(Some(Credentials { uid: *uid, gid }))
        }
        Identity::Username(name) => match lookup_name(name) {
            Some(creds) => Ok(Some(creds)),
            None => Err(LaunchError::InvalidDescriptor(format!(
                "unknown user {name:?}"
            ))),
        },
    }
}

/// Account name for a uid, for helpers that only accept names.
#[cfg(unix)]
pub fn username_for_uid(uid: u32) -> Option<String> {
    lookup_uid(uid).map(|(name, _)| name)
}

#[cfg(not(unix))]
pub fn username_for_uid(_uid: u32) -> Option<String> {
    None
}

#[cfg(unix)]
fn lookup_name(name: &str) -> Option<Credentials> {
    use std::ffi::CString;

    let cname = CString::new(name).ok()?;
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0u8; 4096];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    loop {
        // SAFETY: buffers outlive the call; getpwnam_r writes within bounds.
        let rc = unsafe {
            libc::getpwnam_r(
                cname.as_ptr(),
                &mut pwd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        return Some(Credentials {
            uid: pwd.pw_uid,
            gid: pwd.pw_gid,
        });
    }
}

#[cfg(not(unix))]
fn lookup_name(_name: &str) -> Option<Credentials> {
    None
}

#[cfg(unix)]
fn lookup_uid(uid: u32) -> Option<(String, u32)> {
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0u8; 4096];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    loop {
        // SAFETY: buffers outlive the call; getpwuid_r writes within bounds.
        let rc = unsafe {
            libc::getpwuid_r(
                uid,
                &mut pwd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        let name = unsafe { std::ffi::CStr::from_ptr(pwd.pw_name) }
            .to_string_lossy()
            .into_owned();
        return Some((name, pwd.pw_gid));
    }
}

#[cfg(not(unix))]
fn lookup_uid(_uid: u32) -> Option<(String, u32)> {
    None
}
