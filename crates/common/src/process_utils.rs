use std::io;
use std::path::Path;
use std::process::Command;

/// Put the spawned child in its own process group so the whole tree can be
/// signalled at once.
#[cfg(target_family = "unix")]
pub fn isolate_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(target_family = "unix"))]
pub fn isolate_process_group(_command: &mut Command) {}

/// SIGKILL every process in the group led by `pgid`.
#[cfg(target_family = "unix")]
pub fn kill_process_group(pgid: u32) -> io::Result<()> {
    let ret = unsafe { libc::kill(-(pgid as i32), libc::SIGKILL) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        // ESRCH: the group already exited.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(not(target_family = "unix"))]
pub fn kill_process_group(_pgid: u32) -> io::Result<()> {
    Ok(())
}

/// Whether `pid` names a live process. Falls back to `/proc` when the
/// signal probe is refused for a process owned by another user.
#[cfg(target_family = "unix")]
pub fn process_exists(pid: u32) -> bool {
    let ret = unsafe { libc::kill(pid as i32, 0) };
    ret == 0 || Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_family = "unix"))]
pub fn process_exists(_pid: u32) -> bool {
    false
}

/// Decode captured bytes, replacing invalid UTF-8 and cutting at `max_bytes`
/// on a char boundary. Returns the text and whether it was cut.
pub fn decode_bounded(bytes: &[u8], max_bytes: usize) -> (String, bool) {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max_bytes {
        return (text.into_owned(), false);
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    (text[..cut].to_string(), true)
}

#[cfg(all(test, target_family = "unix"))]
mod tests {
    use super::*;

    #[test]
    fn current_process_exists() {
        assert!(process_exists(std::process::id()));
    }

    #[test]
    fn killing_missing_group_is_not_an_error() {
        assert!(kill_process_group(999_999).is_ok());
    }

    #[test]
    fn decode_bounded_respects_char_boundaries() {
        let (text, truncated) = decode_bounded("héllo".as_bytes(), 2);
        assert_eq!(text, "h");
        assert!(truncated);

        let (text, truncated) = decode_bounded(b"abc", 10);
        assert_eq!(text, "abc");
        assert!(!truncated);
    }
}
