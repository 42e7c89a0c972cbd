//! The named pipes to and from the scheduler.
//!
//! The scheduler closes its end of the request pipe whenever it has nothing to ask. An EOF on the
//! request side is therefore not the end, the pipe gets reopened after a short backoff.

use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, ErrorKind},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use nix::{sys::stat::Mode, unistd::mkfifo};

use crate::Error;

/// Create a fifo at `path`, unless something already exists there.
pub fn ensure_fifo(path: &Path) -> Result<(), Error> {
    if path.exists() {
        return Ok(());
    }
    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) => {
            log::debug!("Created fifo {}", path.display());
            Ok(())
        }
        // lost a race with the scheduler
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Open the decision pipe for writing, creating it if needed. Blocks until the scheduler listens.
pub fn open_decision_pipe(path: &Path) -> Result<File, Error> {
    ensure_fifo(path)?;
    Ok(OpenOptions::new().write(true).open(path)?)
}

/// Where solve requests come from
pub trait RequestSource {
    /// Read one line into `buf`, returns `0` at EOF
    fn read_line(&mut self, buf: &mut String) -> Result<usize, Error>;

    /// Called after EOF, before reading on.
    /// Sources that cannot come back return [`Error::Disconnected`].
    fn reconnect(&mut self) -> Result<(), Error>;

    /// The next non empty line, trailing whitespace and commas removed.
    fn next_request(&mut self) -> Result<String, Error> {
        let mut buf = String::new();
        loop {
            buf.clear();
            if self.read_line(&mut buf)? == 0 {
                self.reconnect()?;
                continue;
            }
            let line = buf.trim_end_matches(|c: char| c == ',' || c.is_ascii_whitespace());
            if !line.is_empty() {
                return Ok(line.to_string());
            }
        }
    }
}

/// Requests from a named pipe, reopened with a backoff whenever the writer goes away.
#[derive(Debug)]
pub struct FifoRequestSource {
    path: PathBuf,
    backoff: Duration,
    reader: Option<BufReader<File>>,
}

impl FifoRequestSource {
    /// Read requests from the fifo at `path`, creating it if needed
    pub fn new<P>(path: P, backoff: Duration) -> Result<Self, Error>
    where
        P: Into<PathBuf>,
    {
        let path = path.into();
        ensure_fifo(&path)?;
        Ok(Self {
            path,
            backoff,
            reader: None,
        })
    }

    /// Path of the fifo
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn reader(&mut self) -> Result<&mut BufReader<File>, Error> {
        if self.reader.is_none() {
            // blocks until a writer shows up
            let file = File::open(&self.path)?;
            self.reader = Some(BufReader::new(file));
        }
        self.reader
            .as_mut()
            .ok_or_else(|| Error::illegal_state("request pipe not open"))
    }
}

impl RequestSource for FifoRequestSource {
    fn read_line(&mut self, buf: &mut String) -> Result<usize, Error> {
        loop {
            match self.reader()?.read_line(buf) {
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                res => return Ok(res?),
            }
        }
    }

    fn reconnect(&mut self) -> Result<(), Error> {
        log::debug!(
            "Request pipe {} closed by the writer, reopening",
            self.path.display()
        );
        self.reader = None;
        thread::sleep(self.backoff);
        Ok(())
    }
}

/// Requests from any reader, gone for good at EOF.
#[derive(Debug)]
pub struct ReaderRequestSource<R> {
    reader: R,
}

impl<R> ReaderRequestSource<R>
where
    R: BufRead,
{
    /// Read requests from `reader`
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R> RequestSource for ReaderRequestSource<R>
where
    R: BufRead,
{
    fn read_line(&mut self, buf: &mut String) -> Result<usize, Error> {
        Ok(self.reader.read_line(buf)?)
    }

    fn reconnect(&mut self) -> Result<(), Error> {
        Err(Error::disconnected("request reader reached EOF"))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs::OpenOptions,
        io::{Cursor, Write},
        thread,
        time::Duration,
    };

    use crate::{
        channel::{ensure_fifo, FifoRequestSource, ReaderRequestSource, RequestSource},
        Error,
    };

    #[test]
    fn test_reader_source() {
        let mut source = ReaderRequestSource::new(Cursor::new("\n \n0,1,2,1,0,5,,\r\n"));
        assert_eq!(source.next_request().unwrap(), "0,1,2,1,0,5");
        assert!(matches!(
            source.next_request(),
            Err(Error::Disconnected(..))
        ));
    }

    #[test]
    fn test_fifo_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests");
        ensure_fifo(&path).unwrap();
        // existing fifos are fine
        ensure_fifo(&path).unwrap();

        let writer_path = path.clone();
        let writer = thread::spawn(move || {
            for line in ["first\n", "second\n"] {
                // every open blocks until the reader opened its end
                let mut fifo = OpenOptions::new().write(true).open(&writer_path).unwrap();
                fifo.write_all(line.as_bytes()).unwrap();
            }
        });

        let mut source = FifoRequestSource::new(&path, Duration::from_millis(1)).unwrap();
        assert_eq!(source.next_request().unwrap(), "first");
        assert_eq!(source.next_request().unwrap(), "second");
        writer.join().unwrap();
    }
}
