//! Send size estimates.
//!
//! libzfs only reports the size of a prospective stream as text on its diagnostic output during a
//! dry run, so [`OutputScrapingEstimator`] runs one with that output pointed at a pipe and reads
//! the number back. The trait is there so a backend with a real estimate call can skip all that.
use std::{fs::File,
          io::{ErrorKind as IoErrorKind, Read},
          os::unix::io::{AsRawFd, FromRawFd, RawFd},
          sync::mpsc,
          thread,
          time::{Duration, Instant}};

use regex::Regex;

use crate::{errors::{Error, Result},
            zfs::{Dataset, SendFlags}};

pub trait SendSizeEstimator {
    /// Size in bytes of the stream `dataset.send_from(from, ...)` would write.
    fn estimate(&self, dataset: &Dataset, from: &str, flags: SendFlags) -> Result<u64>;
}

/// Dry-run send with diagnostics captured through a pipe.
#[derive(Debug, Clone, Copy)]
pub struct OutputScrapingEstimator {
    deadline: Duration,
}

impl OutputScrapingEstimator {
    pub fn new(deadline: Duration) -> Self { OutputScrapingEstimator { deadline } }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

impl SendSizeEstimator for OutputScrapingEstimator {
    fn estimate(&self, dataset: &Dataset, from: &str, flags: SendFlags) -> Result<u64> {
        let flags = flags | SendFlags::DRY_RUN | SendFlags::VERBOSE | SendFlags::PROGRESS | SendFlags::PARSABLE;
        let from = if from.is_empty() { None } else { Some(from) };
        let job = dataset.prepare_send(from, flags)?;
        let started = Instant::now();
        let (reader, writer) = pipe()?;

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let zfs = job.zfs().clone();
            let result = match zfs.call("redirect_diagnostics", |b| b.redirect_diagnostics(writer.as_raw_fd())) {
                Ok(saved) => {
                    let result = job.run_unlocked(writer.as_raw_fd());
                    zfs.with(|b| b.restore_diagnostics(saved));
                    result
                },
                Err(e) => Err(e),
            };
            // Reader sees EOF only once this end is gone.
            drop(writer);
            let _ = tx.send(result);
        });

        let output = read_until_eof(&reader, started, self.deadline)?;
        let remaining = (started + self.deadline).saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(result) => result?,
            Err(mpsc::RecvTimeoutError::Timeout) => return Err(Error::Timeout(self.deadline)),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(Error::Io(std::io::Error::new(IoErrorKind::Other, "send size producer exited")))
            },
        }
        parse_send_size(&output)
    }
}

/// Pull the byte count out of parsable dry-run output.
pub fn parse_send_size(output: &str) -> Result<u64> {
    lazy_static! {
        static ref SIZE: Regex = Regex::new(r"size[ \t]*([0-9]+)").expect("valid regex");
    }
    SIZE.captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|size| size.as_str().parse().ok())
        .ok_or_else(|| Error::SizeParse(output.to_string()))
}

/// Both ends close on drop.
fn pipe() -> Result<(File, File)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let reader = unsafe { File::from_raw_fd(fds[0]) };
    let writer = unsafe { File::from_raw_fd(fds[1]) };
    Ok((reader, writer))
}

fn read_until_eof(mut reader: &File, started: Instant, limit: Duration) -> Result<String> {
    let mut output = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let remaining = limit.checked_sub(started.elapsed()).unwrap_or_default();
        if remaining == Duration::from_secs(0) {
            return Err(Error::Timeout(limit));
        }
        let mut pollfd = libc::pollfd { fd: reader.as_raw_fd(), events: libc::POLLIN, revents: 0 };
        let timeout_ms = remaining.as_millis().min(i32::max_value() as u128) as i32;
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms.max(1)) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == IoErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        if ready == 0 {
            continue;
        }
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => output.extend_from_slice(&buf[..n]),
            Err(ref e) if e.kind() == IoErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(String::from_utf8_lossy(&output).into_owned())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_parsable_output() {
        let output = "full\ttank/fs@snap\t43520\nsize\t43520\n";
        assert_eq!(43520, parse_send_size(output).unwrap());
        assert_eq!(1024, parse_send_size("size 1024").unwrap());
    }

    #[test]
    fn missing_size_is_an_error() {
        let err = parse_send_size("nothing here\n").unwrap_err();
        assert_eq!(crate::errors::ErrorKind::SizeParse, err.kind());
    }

    #[test]
    fn pipe_reads_to_eof() {
        let (reader, mut writer) = pipe().unwrap();
        writer.write_all(b"size\t10\n").unwrap();
        drop(writer);
        let out = read_until_eof(&reader, Instant::now(), Duration::from_secs(5)).unwrap();
        assert_eq!("size\t10\n", out);
    }

    #[test]
    fn pipe_read_times_out_while_writer_open() {
        let (reader, _writer) = pipe().unwrap();
        let err = read_until_eof(&reader, Instant::now(), Duration::from_millis(50)).unwrap_err();
        assert_eq!(crate::errors::ErrorKind::Timeout, err.kind());
    }
}
