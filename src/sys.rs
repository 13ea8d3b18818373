//! Thin wrappers over the POSIX process and signal calls the relay needs.

use std::io;

/// Parse a signal name (`SIGTERM`, `term`, `15`) into its number.
pub fn parse_signal(name: &str) -> Option<i32> {
    let name = name.trim().to_ascii_uppercase();
    if let Ok(number) = name.parse::<i32>() {
        return (1..=64).contains(&number).then_some(number);
    }

    let short = name.strip_prefix("SIG").unwrap_or(&name);
    let signal = match short {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "TERM" => libc::SIGTERM,
        _ => return None,
    };
    Some(signal)
}

/// Send `signal` to `pid`. Signal 0 only checks that the process exists.
pub fn send_signal(pid: u32, signal: i32) -> io::Result<()> {
    // 0 and negative pids address process groups.
    let pid = libc::pid_t::try_from(pid)
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"))?;

    // SAFETY: kill() has no memory safety preconditions.
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Whether a process with `pid` exists, including ones owned by other users.
pub fn is_alive(pid: u32) -> bool {
    match send_signal(pid, 0) {
        Ok(()) => true,
        Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
}
