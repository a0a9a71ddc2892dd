//! A shared console handle serialising output across relay instances.
//!
//! Statistics tables are printed as whole blocks; the mutex guarantees that two
//!  instances reporting at the same moment do not interleave their tables.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct SafeConsole {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl SafeConsole {
    pub fn stdout() -> SafeConsole {
        SafeConsole::with_sink(Box::new(io::stdout()))
    }

    pub fn with_sink(sink: Box<dyn Write + Send>) -> SafeConsole {
        SafeConsole {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    /// Writes one block atomically with respect to other holders of the handle. Console
    ///  write errors are ignored - the log file is the durable record.
    pub fn print(&self, block: &str) {
        let mut sink = self.sink.lock().expect("console mutex poisoned");
        let _ = sink.write_all(block.as_bytes());
        let _ = sink.flush();
    }
}
