use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

/// Where requests are read from.
pub enum Input {
    Stdin,
    Reader(Box<dyn Read + Send>),
}

impl Input {
    pub(crate) fn into_reader(self) -> Box<dyn BufRead> {
        match self {
            Self::Stdin => Box::new(io::stdin().lock()),
            Self::Reader(r) => Box::new(BufReader::new(r)),
        }
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdin => f.write_str("Stdin"),
            Self::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

/// Where responses or diagnostics are written.
pub enum Output {
    Stdout,
    Stderr,
    Writer(Box<dyn Write + Send>),
}

impl Output {
    pub(crate) fn into_writer(self) -> Box<dyn Write + Send> {
        match self {
            Self::Stdout => Box::new(io::stdout()),
            Self::Stderr => Box::new(io::stderr()),
            Self::Writer(w) => w,
        }
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("Stdout"),
            Self::Stderr => f.write_str("Stderr"),
            Self::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

pub(crate) type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

pub(crate) fn lock(w: &SharedWriter) -> MutexGuard<'_, Box<dyn Write + Send>> {
    w.lock().unwrap_or_else(|e| e.into_inner())
}
