use crate::command::Stdout;
use std::fs::File;
use std::io::{self, Result as IoResult, Write};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

/// The terminal's standard output.
pub struct ConsoleStdout;

impl Write for ConsoleStdout {
    fn write(&mut self, data: &[u8]) -> IoResult<usize> {
        io::stdout().lock().write(data)
    }

    fn flush(&mut self) -> IoResult<()> {
        io::stdout().flush()
    }
}

impl Stdout for ConsoleStdout {
    fn stdio(&self) -> Option<Stdio> {
        Some(Stdio::inherit())
    }

    fn try_clone(&self) -> IoResult<Box<dyn Stdout>> {
        Ok(Box::new(ConsoleStdout))
    }
}

/// The terminal's standard error. Diagnostics go here.
pub struct ConsoleStderr;

impl Write for ConsoleStderr {
    fn write(&mut self, data: &[u8]) -> IoResult<usize> {
        io::stderr().lock().write(data)
    }

    fn flush(&mut self) -> IoResult<()> {
        io::stderr().flush()
    }
}

impl Stdout for ConsoleStderr {
    fn stdio(&self) -> Option<Stdio> {
        Some(Stdio::inherit())
    }

    fn try_clone(&self) -> IoResult<Box<dyn Stdout>> {
        Ok(Box::new(ConsoleStderr))
    }
}

/// A redirection target. Children write to a duplicate of the descriptor.
impl Stdout for File {
    fn stdio(&self) -> Option<Stdio> {
        File::try_clone(self).ok().map(Stdio::from)
    }

    fn try_clone(&self) -> IoResult<Box<dyn Stdout>> {
        Ok(Box::new(File::try_clone(self)?))
    }
}

/// Memory-backed writer, used for command substitution and in tests.
///
/// Clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer and a second handle for reading what it collected.
    pub fn with_handle() -> (Self, MemWriter) {
        let mw = MemWriter::new();
        let handle = mw.clone();
        (mw, handle)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        // Poisoning is ignored: the bytes are still usable.
        self.buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    pub fn contents_lossy(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Write for MemWriter {
    fn write(&mut self, data: &[u8]) -> IoResult<usize> {
        self.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }
}

impl Stdout for MemWriter {
    fn stdio(&self) -> Option<Stdio> {
        None
    }

    fn try_clone(&self) -> IoResult<Box<dyn Stdout>> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_mem_writer_shares_buffer() {
        let (mut writer, handle) = MemWriter::with_handle();
        write!(writer, "hello ").unwrap();
        let mut clone = writer.try_clone().unwrap();
        write!(clone, "world").unwrap();
        assert_eq!(handle.contents_lossy(), "hello world");
        assert!(writer.stdio().is_none());

        handle.clear();
        assert!(writer.contents().is_empty());
    }

    #[test]
    fn test_file_clone_appends_to_same_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut file = tmp.reopen().unwrap();
        write!(file, "a").unwrap();
        let mut clone = Stdout::try_clone(&file).unwrap();
        write!(clone, "b").unwrap();
        clone.flush().unwrap();

        let mut text = String::new();
        File::open(tmp.path())
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "ab");
    }
}
