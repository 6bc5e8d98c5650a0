use crate::virtual_machine::errors::VMError;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

/// Character streams behind `GETCHAR` and `PUTCHAR`.
pub struct Console {
    input: Box<dyn Read + Send>,
    output: Box<dyn Write + Send>,
}

impl Console {
    pub fn new(input: Box<dyn Read + Send>, output: Box<dyn Write + Send>) -> Self {
        Self { input, output }
    }

    /// Console bound to the process's standard input and output.
    pub fn stdio() -> Self {
        Self::new(Box::new(io::stdin()), Box::new(io::stdout()))
    }

    /// Reads one byte, blocking until it is available. `None` at end of input.
    pub fn read_char(&mut self) -> Result<Option<u8>, VMError> {
        let mut buf = [0u8; 1];
        loop {
            match self.input.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(VMError::StreamError(e.to_string())),
            }
        }
    }

    /// Writes one byte and flushes it on a newline.
    pub fn write_char(&mut self, byte: u8) -> Result<(), VMError> {
        self.output
            .write_all(&[byte])
            .map_err(|e| VMError::StreamError(e.to_string()))?;
        if byte == b'\n' {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), VMError> {
        self.output
            .flush()
            .map_err(|e| VMError::StreamError(e.to_string()))
    }
}

/// In-memory output sink that can be read back while the VM owns a clone.
#[derive(Clone, Default)]
pub struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl SharedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Output decoded as UTF-8, with invalid sequences replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
