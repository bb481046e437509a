use std::io;

/// Detaches from the controlling terminal: fork, new session, stdio onto
/// /dev/null. The working directory is kept so relative config paths stay
/// valid.
pub fn daemonize() -> io::Result<()> {
    let rc = unsafe { libc::daemon(1, 0) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
