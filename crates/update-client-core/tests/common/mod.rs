//! Shared fixtures for the end-to-end client tests.

pub mod repo;

use std::io::{self, Write};

use update_client_core::Destination;

/// In-memory destination recording whether `delete` was invoked.
#[derive(Debug, Default)]
pub struct TestDestination {
    pub bytes: Vec<u8>,
    pub deleted: bool,
}

impl Write for TestDestination {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Destination for TestDestination {
    fn delete(&mut self) -> io::Result<()> {
        self.deleted = true;
        self.bytes.clear();
        Ok(())
    }
}
