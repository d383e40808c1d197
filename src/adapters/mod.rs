//! Instrument I/O boundary.
//!
//! Procedures talk to instruments through an [`Adapter`]: a line-oriented
//! `write`/`read` surface plus a raw byte path. The execution engine never calls
//! adapters itself; they are owned by procedures and opened in `startup()`.
//!
//! Adapters return `anyhow::Result` so driver errors keep their context chain
//! when a procedure propagates them out of a lifecycle method.

pub mod mock;

pub use mock::MockAdapter;

use anyhow::Result;
use async_trait::async_trait;

/// Communication channel to one instrument.
#[async_trait]
pub trait Adapter: Send {
    /// Short name for log messages (e.g. "mock", "serial").
    fn name(&self) -> &str;

    /// Send one command line (without terminator).
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Read one response line (terminator stripped).
    async fn read(&mut self) -> Result<String>;

    /// Write a command and read its response.
    async fn ask(&mut self, command: &str) -> Result<String> {
        self.write(command).await?;
        self.read().await
    }

    /// Send raw bytes.
    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read exactly `count` raw bytes.
    async fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>>;
}
