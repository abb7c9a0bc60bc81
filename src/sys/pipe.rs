use std::io;

use super::FileDesc;

/// A non-blocking close-on-exec pipe pair: (reader, writer).
pub fn pipe() -> io::Result<(FileDesc, FileDesc)> {
    let mut fds = [0; 2];

    #[cfg(any(target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))]
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        syscall!(pipe(fds.as_mut_ptr()))?;
        for &fd in fds.iter() {
            syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
            syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK))?;
        }
    }

    Ok((FileDesc::new(fds[0]), FileDesc::new(fds[1])))
}
