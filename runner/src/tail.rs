use std::{
    fs::File,
    io::{self, Read},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

/// Reader that follows a file another process is still writing.
///
/// At end-of-file it sleeps for the poll interval and tries again
/// instead of reporting EOF. Once the shared `stop` flag is raised it
/// performs one final drain and then ends the stream, so lines written
/// just before the flag are never lost.
#[derive(Debug)]
pub struct TailReader {
    file: File,
    poll: Duration,
    stop: Arc<AtomicBool>,
    draining: bool,
}

impl TailReader {
    /// Opens `path` for following, waiting for the file to appear
    /// first. The wait is abandoned with `NotFound` when `stop` is
    /// raised before the file shows up.
    pub fn open(path: &Path, poll: Duration, stop: Arc<AtomicBool>) -> io::Result<TailReader> {
        loop {
            match File::open(path) {
                Ok(file) => {
                    return Ok(TailReader {
                        file,
                        poll,
                        stop,
                        draining: false,
                    })
                }
                Err(error) if error.kind() == io::ErrorKind::NotFound => {
                    if stop.load(Ordering::Acquire) {
                        return Err(error);
                    }
                    thread::sleep(poll);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl Read for TailReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.file.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            if self.draining {
                return Ok(0);
            }
            if self.stop.load(Ordering::Acquire) {
                self.draining = true;
                continue;
            }
            thread::sleep(self.poll);
        }
    }
}
