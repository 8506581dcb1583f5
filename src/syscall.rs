use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{FromRawFd, RawFd};

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

use crate::{Error, Pid};

pub(crate) fn pidfd_open(pid: Pid) -> Result<File, Errno> {
    let res = unsafe {
        nix::libc::syscall(
            nix::libc::SYS_pidfd_open,
            pid.as_raw(),
            0 as nix::libc::c_uint,
        )
    };
    Errno::result(res).map(|v| unsafe { File::from_raw_fd(v as RawFd) })
}

pub(crate) struct Pipe {
    rx: File,
    tx: File,
}

impl Pipe {
    pub fn rx(self) -> impl Read {
        drop(self.tx);
        self.rx
    }

    pub fn tx(self) -> impl Write {
        drop(self.rx);
        self.tx
    }
}

pub(crate) fn new_pipe() -> Result<Pipe, Error> {
    let (rx, tx) = nix::unistd::pipe()?;
    let rx = unsafe { File::from_raw_fd(rx) };
    let tx = unsafe { File::from_raw_fd(tx) };
    Ok(Pipe { rx, tx })
}

/// Blocks until the writer side closes or writes a single byte.
///
/// Used as the parent->child handshake: the child blocks here until the
/// parent has finished writing uid_map/gid_map/setgroups, replacing a
/// fixed sleep with an exact synchronization point.
pub(crate) fn read_ok(mut rx: impl Read) -> Result<(), Error> {
    Ok(rx.read_exact(&mut [0; 1])?)
}

pub(crate) fn write_ok(mut tx: impl Write) -> Result<(), Error> {
    Ok(tx.write_all(&[0])?)
}

pub(crate) fn read_result(mut rx: impl Read) -> Result<Result<(), Error>, Error> {
    let mut buf = [0; std::mem::size_of::<u8>()];
    rx.read_exact(&mut buf)?;
    match u8::from_le_bytes(buf) {
        0 => Ok(Ok(())),
        1 => {
            let mut buf = [0; std::mem::size_of::<usize>()];
            rx.read_exact(&mut buf)?;
            let len = usize::from_le_bytes(buf);
            let mut buf = vec![0; len];
            rx.read_exact(&mut buf)?;
            Ok(Err(String::from_utf8(buf)?.into()))
        }
        _ => unreachable!(),
    }
}

pub(crate) fn write_result(mut tx: impl Write, result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Ok(()) => Ok(tx.write_all(&u8::to_le_bytes(0))?),
        Err(err) => {
            tx.write_all(&u8::to_le_bytes(1))?;
            let msg = err.to_string();
            tx.write_all(&usize::to_le_bytes(msg.as_bytes().len()))?;
            Ok(tx.write_all(msg.as_bytes())?)
        }
    }
}

pub(crate) fn exit_child<T, E>(result: Result<T, E>) -> ! {
    match result {
        Ok(_) => unsafe { nix::libc::_exit(0) },
        Err(_) => unsafe { nix::libc::_exit(1) },
    }
}

/// Owns a child pid: reaps it on drop if nobody has waited on it yet.
pub(crate) struct OwnedPid(Option<Pid>);

impl OwnedPid {
    pub unsafe fn from_raw(pid: Pid) -> Self {
        Self(Some(pid))
    }

    pub fn as_raw(&self) -> Pid {
        self.0.unwrap()
    }

    pub fn into_raw(mut self) -> Pid {
        self.0.take().unwrap()
    }

    pub fn wait(self) -> Result<WaitStatus, Error> {
        Ok(waitpid(self.into_raw(), Some(WaitPidFlag::__WALL))?)
    }

    pub fn wait_success(self) -> Result<(), Error> {
        match self.wait()? {
            WaitStatus::Exited(_, 0) => Ok(()),
            WaitStatus::Exited(_, code) => Err(format!("child exited with: {code}").into()),
            WaitStatus::Signaled(_, sig, _) => Err(format!("child killed with: {sig}").into()),
            status => Err(format!("unexpected wait status: {status:?}").into()),
        }
    }
}

impl Drop for OwnedPid {
    fn drop(&mut self) {
        if let Some(pid) = self.0.take() {
            let _ = waitpid(pid, Some(WaitPidFlag::__WALL));
        }
    }
}
