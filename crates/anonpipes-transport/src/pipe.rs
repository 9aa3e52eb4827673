use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, TransportError};

/// Number of `yield_now` rounds before drain polling falls back to sleeping.
const DRAIN_SPIN_ROUNDS: u32 = 64;

/// Read end of an anonymous pipe.
pub struct PipeReader {
    file: File,
}

/// Write end of an anonymous pipe.
pub struct PipeWriter {
    file: File,
}

/// A pipe end meant for a child process.
///
/// The descriptor has close-on-exec cleared so a spawned child inherits it.
/// [`handle_string`](Self::handle_string) is what the child receives on its
/// command line.
pub struct InheritableHandle {
    fd: OwnedFd,
}

/// Create an anonymous pipe. Both ends are close-on-exec.
pub fn anonymous_pipe() -> Result<(PipeReader, PipeWriter)> {
    let (read, write) = raw_pipe().map_err(TransportError::Create)?;
    debug!(
        read_fd = read.as_raw_fd(),
        write_fd = write.as_raw_fd(),
        "created anonymous pipe"
    );
    Ok((
        PipeReader {
            file: File::from(read),
        },
        PipeWriter {
            file: File::from(write),
        },
    ))
}

/// Create a pipe this process reads from and a child writes to.
pub fn inbound_pipe() -> Result<(PipeReader, InheritableHandle)> {
    let (reader, writer) = anonymous_pipe()?;
    let handle = InheritableHandle::new(OwnedFd::from(writer.file))?;
    Ok((reader, handle))
}

/// Create a pipe this process writes to and a child reads from.
pub fn outbound_pipe() -> Result<(PipeWriter, InheritableHandle)> {
    let (reader, writer) = anonymous_pipe()?;
    let handle = InheritableHandle::new(OwnedFd::from(reader.file))?;
    Ok((writer, handle))
}

impl PipeReader {
    /// Open the read end named by an inherited handle string.
    ///
    /// Takes ownership of the descriptor: it is closed when the reader drops.
    pub fn from_handle(handle: &str) -> Result<Self> {
        let fd = open_handle(handle)?;
        Ok(Self {
            file: File::from(fd),
        })
    }
}

impl PipeWriter {
    /// Open the write end named by an inherited handle string.
    ///
    /// Takes ownership of the descriptor: it is closed when the writer drops.
    pub fn from_handle(handle: &str) -> Result<Self> {
        let fd = open_handle(handle)?;
        Ok(Self {
            file: File::from(fd),
        })
    }

    /// Bytes written to the pipe that the reading side has not consumed yet.
    ///
    /// Exact on Linux. Platforms that do not report the count for the write
    /// end always return 0.
    pub fn pending_bytes(&self) -> io::Result<usize> {
        let mut pending: libc::c_int = 0;
        // SAFETY: the descriptor is open for the lifetime of `self` and
        // `pending` is a valid, writable c_int for FIONREAD.
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), libc::FIONREAD, &mut pending) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(pending.max(0) as usize)
    }

    /// Returns true once every read end of the pipe has been closed.
    pub fn peer_closed(&self) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };
        // SAFETY: `pfd` is a single valid pollfd and the timeout is zero.
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0)
    }

    /// Block until the reading side has consumed everything written so far.
    ///
    /// Returns `Ok(true)` once drained and `Ok(false)` if `abort` returned true
    /// first. Fails with `BrokenPipe` when the read side closes with bytes
    /// still unread.
    pub fn wait_for_drain(
        &self,
        poll_interval: Duration,
        abort: impl Fn() -> bool,
    ) -> io::Result<bool> {
        let mut rounds = 0u32;
        loop {
            if self.pending_bytes()? == 0 {
                return Ok(true);
            }
            if self.peer_closed()? {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe reader closed before draining",
                ));
            }
            if abort() {
                return Ok(false);
            }
            if rounds < DRAIN_SPIN_ROUNDS {
                rounds += 1;
                std::thread::yield_now();
            } else {
                std::thread::sleep(poll_interval);
            }
        }
    }
}

impl InheritableHandle {
    /// Wrap a descriptor and clear its close-on-exec flag.
    pub fn new(fd: OwnedFd) -> Result<Self> {
        set_inheritable(fd.as_fd(), true)?;
        Ok(Self { fd })
    }

    /// The opaque handle string passed to the child process.
    pub fn handle_string(&self) -> String {
        self.fd.as_raw_fd().to_string()
    }

    /// Give up ownership without closing the descriptor.
    ///
    /// Whoever opens the handle string afterwards becomes the owner.
    pub fn into_raw(self) -> RawFd {
        self.fd.into_raw_fd()
    }

    /// Keep the descriptor in this process as the read end of the pipe.
    ///
    /// Close-on-exec is set again, so later children do not inherit it.
    pub fn into_reader(self) -> Result<PipeReader> {
        set_inheritable(self.fd.as_fd(), false)?;
        Ok(PipeReader {
            file: File::from(self.fd),
        })
    }

    /// Keep the descriptor in this process as the write end of the pipe.
    pub fn into_writer(self) -> Result<PipeWriter> {
        set_inheritable(self.fd.as_fd(), false)?;
        Ok(PipeWriter {
            file: File::from(self.fd),
        })
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl AsFd for PipeReader {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsFd for PipeWriter {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsFd for InheritableHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl std::fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeReader")
            .field("fd", &self.file.as_raw_fd())
            .finish()
    }
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter")
            .field("fd", &self.file.as_raw_fd())
            .finish()
    }
}

impl std::fmt::Debug for InheritableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InheritableHandle")
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn raw_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` is a writable array of two c_ints as pipe2 requires.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 succeeded, so both descriptors are open and owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn raw_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` is a writable array of two c_ints as pipe requires.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe succeeded, so both descriptors are open and owned by nobody else.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_inheritable(read.as_fd(), false)?;
    set_inheritable(write.as_fd(), false)?;
    Ok((read, write))
}

fn set_inheritable(fd: BorrowedFd<'_>, inheritable: bool) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: `raw` is borrowed from an open descriptor for the duration of the call.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let updated = if inheritable {
        flags & !libc::FD_CLOEXEC
    } else {
        flags | libc::FD_CLOEXEC
    };
    if updated != flags {
        // SAFETY: as above; F_SETFD only changes descriptor flags.
        let rc = unsafe { libc::fcntl(raw, libc::F_SETFD, updated) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn open_handle(handle: &str) -> Result<OwnedFd> {
    let raw: RawFd = handle
        .trim()
        .parse()
        .map_err(|_| TransportError::InvalidHandle {
            handle: handle.to_string(),
            reason: "not a descriptor number".to_string(),
        })?;
    if raw < 0 {
        return Err(TransportError::InvalidHandle {
            handle: handle.to_string(),
            reason: "negative descriptor".to_string(),
        });
    }

    // SAFETY: F_GETFD only inspects the descriptor table; an unknown number yields EBADF.
    if unsafe { libc::fcntl(raw, libc::F_GETFD) } < 0 {
        return Err(TransportError::InvalidHandle {
            handle: handle.to_string(),
            reason: io::Error::last_os_error().to_string(),
        });
    }

    // SAFETY: the descriptor is open and, by the handle-passing contract, was
    // handed to this process for exclusive use.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    // Keep it out of any grandchildren.
    set_inheritable(fd.as_fd(), false)?;
    debug!(fd = raw, "opened inherited pipe handle");
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_cloexec(fd: BorrowedFd<'_>) -> bool {
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
        assert!(flags >= 0);
        flags & libc::FD_CLOEXEC != 0
    }

    #[test]
    fn pipe_roundtrip() {
        let (mut reader, mut writer) = anonymous_pipe().unwrap();
        writer.write_all(b"hello").unwrap();
        drop(writer);

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn pipe_ends_are_close_on_exec() {
        let (reader, writer) = anonymous_pipe().unwrap();
        assert!(is_cloexec(reader.as_fd()));
        assert!(is_cloexec(writer.as_fd()));
    }

    #[test]
    fn exported_ends_are_inheritable() {
        let (reader, child_write) = inbound_pipe().unwrap();
        let (writer, child_read) = outbound_pipe().unwrap();

        assert!(is_cloexec(reader.as_fd()));
        assert!(is_cloexec(writer.as_fd()));
        assert!(!is_cloexec(child_write.as_fd()));
        assert!(!is_cloexec(child_read.as_fd()));
    }

    #[test]
    fn handle_string_reopens_the_same_pipe() {
        let (mut reader, child_write) = inbound_pipe().unwrap();
        let handle = child_write.handle_string();
        let _ = child_write.into_raw();

        let mut writer = PipeWriter::from_handle(&handle).unwrap();
        assert!(is_cloexec(writer.as_fd()));
        writer.write_all(b"via-handle").unwrap();
        drop(writer);

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"via-handle");
    }

    #[test]
    fn exported_ends_can_stay_in_process() {
        let (mut reader, child_write) = inbound_pipe().unwrap();
        let (mut writer, child_read) = outbound_pipe().unwrap();

        let mut child_write = child_write.into_writer().unwrap();
        let mut child_read = child_read.into_reader().unwrap();
        assert!(is_cloexec(child_write.as_fd()));
        assert!(is_cloexec(child_read.as_fd()));

        writer.write_all(b"down").unwrap();
        let mut buf = [0u8; 4];
        child_read.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"down");

        child_write.write_all(b"up").unwrap();
        drop(child_write);
        let mut up = Vec::new();
        reader.read_to_end(&mut up).unwrap();
        assert_eq!(up, b"up");
    }

    #[test]
    fn rejects_malformed_handles() {
        for handle in ["", "abc", "-4", "12x"] {
            let err = PipeReader::from_handle(handle).unwrap_err();
            assert!(
                matches!(err, TransportError::InvalidHandle { .. }),
                "handle {handle:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_closed_descriptor() {
        let (reader, _writer) = anonymous_pipe().unwrap();
        let raw = reader.file.as_raw_fd();
        drop(reader);

        // The number could be reused by a concurrent test; only assert when it is not.
        if unsafe { libc::fcntl(raw, libc::F_GETFD) } < 0 {
            let err = PipeReader::from_handle(&raw.to_string()).unwrap_err();
            assert!(matches!(err, TransportError::InvalidHandle { .. }));
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn pending_bytes_tracks_unread_data() {
        let (mut reader, mut writer) = anonymous_pipe().unwrap();
        assert_eq!(writer.pending_bytes().unwrap(), 0);

        writer.write_all(&[7u8; 10]).unwrap();
        assert_eq!(writer.pending_bytes().unwrap(), 10);

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(writer.pending_bytes().unwrap(), 6);
    }

    #[test]
    fn drain_completes_once_reader_consumes() {
        let (mut reader, mut writer) = anonymous_pipe().unwrap();
        writer.write_all(&[1u8; 1024]).unwrap();

        let consumer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let mut buf = [0u8; 1024];
            reader.read_exact(&mut buf).unwrap();
            reader
        });

        let drained = writer
            .wait_for_drain(Duration::from_millis(1), || false)
            .unwrap();
        assert!(drained);
        let _reader = consumer.join().unwrap();
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn drain_aborts_on_request() {
        let (_reader, mut writer) = anonymous_pipe().unwrap();
        writer.write_all(b"stuck").unwrap();

        let drained = writer
            .wait_for_drain(Duration::from_millis(1), || true)
            .unwrap();
        assert!(!drained);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn drain_fails_when_reader_closes() {
        let (reader, mut writer) = anonymous_pipe().unwrap();
        writer.write_all(b"orphaned").unwrap();
        drop(reader);

        assert!(writer.peer_closed().unwrap());
        let err = writer
            .wait_for_drain(Duration::from_millis(1), || false)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn write_after_reader_closed_is_broken_pipe() {
        let (reader, mut writer) = anonymous_pipe().unwrap();
        drop(reader);

        let err = writer.write_all(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
