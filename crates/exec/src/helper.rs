//! External privilege helpers: discovery, argv rewriting, askpass plumbing.
//!
//! When neither the caller nor the daemon can switch identities directly, a
//! system helper does the elevation.  Preference order is fixed: `sudo`,
//! then `doas`, then `pkexec`.  The fixed-password flow never puts the
//! password on a command line; it goes through a throwaway askpass script
//! referenced by `SUDO_ASKPASS`.

use std::io::{self, Write as _};
use std::path::PathBuf;

pub use tempfile::TempPath;

use forker_protocol::{Identity, LaunchError};

use crate::identity;
use crate::path::resolve_executable;

/// Environment variable sudo consults to locate its password provider.
pub const ASKPASS_ENV: &str = "SUDO_ASKPASS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperKind {
    Sudo,
    Doas,
    Pkexec,
}

#[derive(Debug, Clone)]
pub struct Helper {
    pub kind: HelperKind,
    pub path: PathBuf,
}

/// Finds the preferred helper available on `PATH`.
pub fn find_helper() -> Option<Helper> {
    const CANDIDATES: &[(&str, HelperKind)] = &[
        ("sudo", HelperKind::Sudo),
        ("doas", HelperKind::Doas),
        ("pkexec", HelperKind::Pkexec),
    ];
    CANDIDATES.iter().find_map(|(name, kind)| {
        resolve_executable(name, None).map(|path| Helper { kind: *kind, path })
    })
}

/// The argv rewrite plus environment a helper launch needs.
#[derive(Debug)]
pub struct HelperInvocation {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Askpass script; deleted when dropped, whatever the outcome.
    pub askpass: Option<TempPath>,
}

/// Rewrites `argv` so `helper` runs it under `identity`.
///
/// `interactive` permits the helper to prompt on the caller's terminal; the
/// daemon always passes `false` because it has none.
pub fn rewrite(
    helper: &Helper,
    identity: &Identity,
    argv: &[String],
    interactive: bool,
) -> Result<HelperInvocation, LaunchError> {
    let helper_path = helper.path.to_string_lossy().into_owned();
    let mut out = vec![helper_path];
    let mut env = Vec::new();
    let mut askpass = None;

    match (helper.kind, identity) {
        (_, Identity::Current) => {
            return Err(LaunchError::InvalidDescriptor(
                "helper launch for the current identity".into(),
            ));
        }
        (HelperKind::Sudo, Identity::FixedPasswordSudo(password)) => {
            let script = write_askpass_script(password)
                .map_err(|err| LaunchError::exec_failed("askpass", &err))?;
            env.push((
                ASKPASS_ENV.to_string(),
                script.to_string_lossy().into_owned(),
            ));
            out.push("-A".to_string());
            askpass = Some(script);
        }
        (_, Identity::FixedPasswordSudo(_)) => {
            // Only sudo understands askpass; the password cannot be fed to
            // doas or pkexec without a terminal.
            return Err(LaunchError::ElevationUnavailable);
        }
        (HelperKind::Sudo, target) => {
            if !interactive {
                out.push("-n".to_string());
            }
            if let Some(user) = helper_user(target)? {
                out.push("-u".to_string());
                out.push(user);
            }
        }
        (HelperKind::Doas, target) => {
            if !interactive {
                out.push("-n".to_string());
            }
            if let Some(user) = helper_user(target)? {
                out.push("-u".to_string());
                out.push(user);
            }
        }
        (HelperKind::Pkexec, target) => {
            if let Some(user) = helper_user(target)? {
                out.push("--user".to_string());
                out.push(user);
            }
        }
    }

    if helper.kind == HelperKind::Sudo {
        out.push("--".to_string());
    }
    out.extend(argv.iter().cloned());

    Ok(HelperInvocation {
        argv: out,
        env,
        askpass,
    })
}

/// The account name a helper should be told about, `None` for the helper's
/// default (root).
fn helper_user(identity: &Identity) -> Result<Option<String>, LaunchError> {
    match identity {
        Identity::Administrator | Identity::FixedPasswordSudo(_) => Ok(None),
        Identity::Uid(0) => Ok(None),
        Identity::Uid(uid) => match identity::username_for_uid(*uid) {
            Some(name) => Ok(Some(name)),
            // sudo accepts numeric uids with a leading '#'.
            None => Ok(Some(format!("#{uid}"))),
        },
        Identity::Username(name) => Ok(Some(name.clone())),
        Identity::Current => Ok(None),
    }
}

/// Writes the one-shot askpass script sudo will call for the password.
///
/// Mode 0700; the returned [`TempPath`] unlinks the script on drop, so it
/// disappears regardless of how the launch ends.
pub fn write_askpass_script(password: &str) -> io::Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("forker-askpass-")
        .suffix(".sh")
        .tempfile()?;

    let quoted = password.replace('\'', r"'\''");
    write!(file, "#!/bin/sh\nprintf '%s\\n' '{quoted}'\n")?;
    file.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(file.into_temp_path())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sudo() -> Helper {
        Helper {
            kind: HelperKind::Sudo,
            path: PathBuf::from("/usr/bin/sudo"),
        }
    }

    #[test]
    fn sudo_rewrite_targets_root_by_default() {
        let argv = vec!["id".to_string(), "-u".to_string()];
        let inv = rewrite(&sudo(), &Identity::Administrator, &argv, true).unwrap();
        assert_eq!(inv.argv, vec!["/usr/bin/sudo", "--", "id", "-u"]);
        assert!(inv.askpass.is_none());
    }

    #[test]
    fn non_interactive_sudo_never_prompts() {
        let argv = vec!["true".to_string()];
        let inv = rewrite(&sudo(), &Identity::Administrator, &argv, false).unwrap();
        assert_eq!(inv.argv[1], "-n");
    }

    #[test]
    fn username_identity_is_forwarded() {
        let argv = vec!["whoami".to_string()];
        let inv = rewrite(
            &sudo(),
            &Identity::Username("nobody".into()),
            &argv,
            true,
        )
        .unwrap();
        assert!(inv.argv.windows(2).any(|w| w == ["-u", "nobody"]));
    }

    #[test]
    fn fixed_password_goes_through_askpass() {
        let argv = vec!["true".to_string()];
        let inv = rewrite(
            &sudo(),
            &Identity::FixedPasswordSudo("secret".into()),
            &argv,
            true,
        )
        .unwrap();
        assert!(inv.argv.contains(&"-A".to_string()));
        assert!(!inv.argv.iter().any(|a| a.contains("secret")));
        let (key, value) = &inv.env[0];
        assert_eq!(key, ASKPASS_ENV);
        let script = std::fs::read_to_string(value).unwrap();
        assert!(script.contains("secret"));
    }

    #[test]
    fn askpass_script_vanishes_on_drop() {
        let path = {
            let script = write_askpass_script("pw").unwrap();
            let copy = script.to_path_buf();
            assert!(copy.exists());
            copy
        };
        assert!(!path.exists());
    }

    #[test]
    fn fixed_password_without_sudo_is_unavailable() {
        let doas = Helper {
            kind: HelperKind::Doas,
            path: PathBuf::from("/usr/bin/doas"),
        };
        let argv = vec!["true".to_string()];
        let err = rewrite(
            &doas,
            &Identity::FixedPasswordSudo("pw".into()),
            &argv,
            true,
        )
        .unwrap_err();
        assert!(matches!(err, LaunchError::ElevationUnavailable));
    }

    #[cfg(unix)]
    #[test]
    fn askpass_script_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let script = write_askpass_script("pw").unwrap();
        let mode = std::fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn quotes_in_passwords_survive_quoting() {
        let script = write_askpass_script("it's'quoted").unwrap();
        let body = std::fs::read_to_string(&script).unwrap();
        assert!(body.contains(r"'\''"));
    }
}
