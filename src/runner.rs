use std::fs::File;

use nix::errno::Errno;
use nix::unistd::{chdir, chroot};

use crate::{read_record, write_record, Error, Frame, Request, Response};

/// Re-roots inside the already-built sandbox: `chroot(".")` then
/// `chdir("/")`. The wrapper has already pivoted, so this is not a
/// privilege boundary; it is skipped when the run user lacks the chroot
/// capability.
pub fn rechroot() -> Result<(), Error> {
    match chroot(".") {
        Ok(()) | Err(Errno::EPERM) => {}
        Err(err) => return Err(err.into()),
    }
    Ok(chdir("/")?)
}

/// The control connection of a runner: the fifo pair whose base path is
/// passed on the command line.
pub struct RunnerConnection {
    rx: File,
    tx: File,
}

impl RunnerConnection {
    /// Opens `<base>.in` for reading, then `<base>.out` for writing, the
    /// order the monitor mirrors on its side of the rendezvous.
    pub fn attach(pipe_base: &str) -> Result<Self, Error> {
        let rx = File::open(format!("{pipe_base}.in"))?;
        let tx = File::options()
            .write(true)
            .open(format!("{pipe_base}.out"))?;
        Ok(Self { rx, tx })
    }

    /// Serves incoming requests until `stop_runner` arrives. `stop_runner`
    /// is acknowledged before returning so the supervisor sees a clean
    /// shutdown; everything else goes to `handler`.
    pub fn serve(mut self, mut handler: impl FnMut(Request) -> Response) -> Result<(), Error> {
        loop {
            match read_record(&mut self.rx)? {
                Frame::Request { id, body } => {
                    let stop = matches!(body, Request::StopRunner);
                    let body = if stop { Response::Ok } else { handler(body) };
                    write_record(&mut self.tx, &Frame::Response { id, body })?;
                    if stop {
                        return Ok(());
                    }
                }
                Frame::Response { .. } => continue,
            }
        }
    }
}

/// The generic runner: enter the sandbox contract, attach the control
/// pipes and serve until told to stop.
pub fn run_runner(pipe_base: &str) -> Result<(), Error> {
    rechroot()?;
    let conn = RunnerConnection::attach(pipe_base)?;
    conn.serve(|_| Response::Failed("unsupported request".into()))
}
